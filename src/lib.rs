//! Protocol-multiplexing TCP front-end.
//!
//! Every accepted connection is offered to several protocol handlers at
//! once; they share one view of the byte stream until exactly one of them
//! owns the connection.

pub mod config;
pub mod engine;
pub mod framework;
pub mod lifecycle;
pub mod observability;
pub mod protocols;

pub use config::Config;
pub use engine::{Connection, Engine, MuxError};
pub use framework::{Protocol, ProtocolInstance, ProtocolRegistry};
pub use lifecycle::Shutdown;
