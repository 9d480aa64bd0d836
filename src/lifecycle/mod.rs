//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Listener::stop → trigger → accept loop exits
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → main stops the engine
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, then force-close connections

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_termination;
