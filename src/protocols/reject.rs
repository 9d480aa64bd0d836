//! `reject`: claim connections that open with a known prefix, send a
//! message and hang up.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Parameters;
use crate::engine::{Connection, Result};
use crate::framework::{Protocol, ProtocolInstance};
use crate::protocols::{read_prefix, Settings};

pub const NAME: &str = "reject";

const PARAMETERS: &[&str] = &["prefix", "priority", "message"];

#[derive(Debug, Default, Clone, Copy)]
pub struct Reject;

impl Protocol for Reject {
    fn configure(
        &self,
        globals: &Parameters,
        remote_name: &str,
        remote_params: &Parameters,
    ) -> Result<Arc<dyn ProtocolInstance>> {
        let settings = Settings::new(NAME, remote_name, globals, remote_params, PARAMETERS)?;
        Ok(Arc::new(RejectInstance {
            prefixes: settings.required_strings("prefix")?.to_vec(),
            priority: settings.priority()?,
            message: settings.single_string("message")?.map(str::to_string),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RejectInstance {
    prefixes: Vec<String>,
    priority: u32,
    message: Option<String>,
}

#[async_trait]
impl ProtocolInstance for RejectInstance {
    async fn handle(&self, conn: Connection) -> Result<()> {
        read_prefix(&conn, &self.prefixes).await?;
        conn.require_exclusive(self.priority).await?;
        if let Some(message) = &self.message {
            conn.write_all(message.as_bytes()).await?;
        }
        tracing::debug!(
            connection_id = %conn.connection_id(),
            remote = %conn.remote_name(),
            "Connection rejected"
        );
        Ok(())
    }
}
