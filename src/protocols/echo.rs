//! `echo`: claim connections that open with a known prefix and echo them.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Parameters;
use crate::engine::{Connection, Result, READ_BUFFER_SIZE};
use crate::framework::{Protocol, ProtocolInstance};
use crate::protocols::{read_prefix, Settings};

pub const NAME: &str = "echo";

const PARAMETERS: &[&str] = &["prefix", "priority", "greeting"];

/// Echo protocol factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Protocol for Echo {
    fn configure(
        &self,
        globals: &Parameters,
        remote_name: &str,
        remote_params: &Parameters,
    ) -> Result<Arc<dyn ProtocolInstance>> {
        let settings = Settings::new(NAME, remote_name, globals, remote_params, PARAMETERS)?;
        Ok(Arc::new(EchoInstance {
            prefixes: settings.required_strings("prefix")?.to_vec(),
            priority: settings.priority()?,
            greeting: settings.single_string("greeting")?.map(str::to_string),
        }))
    }
}

/// One configured echo remote.
#[derive(Debug, Clone)]
pub struct EchoInstance {
    prefixes: Vec<String>,
    priority: u32,
    /// Written before claiming, so it reaches the peer only if every other
    /// candidate sends the same bytes.
    greeting: Option<String>,
}

#[async_trait]
impl ProtocolInstance for EchoInstance {
    async fn handle(&self, conn: Connection) -> Result<()> {
        let consumed = read_prefix(&conn, &self.prefixes).await?;

        if let Some(greeting) = &self.greeting {
            conn.write_all(greeting.as_bytes()).await?;
        }
        conn.require_exclusive(self.priority).await?;
        conn.write_all(&consumed).await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
        }
    }
}
