//! Shared utilities for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use protomux::config::Parameters;
use protomux::engine::{Connection, RemoteConnection, RemoteContext, Reporter, Result, Socket};
use protomux::framework::{ConfiguredProtocol, Protocol, ProtocolInstance};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// A protocol instance backed by an async closure.
pub struct FnInstance<F>(pub F);

#[async_trait]
impl<F, Fut> ProtocolInstance for FnInstance<F>
where
    F: Fn(Connection) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, conn: Connection) -> Result<()> {
        (self.0)(conn).await
    }
}

pub fn instance<F, Fut>(f: F) -> Arc<dyn ProtocolInstance>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnInstance(f))
}

/// A protocol whose every remote gets the same instance.
pub struct Fixed(pub Arc<dyn ProtocolInstance>);

impl Protocol for Fixed {
    fn configure(
        &self,
        _globals: &Parameters,
        _remote_name: &str,
        _remote_params: &Parameters,
    ) -> Result<Arc<dyn ProtocolInstance>> {
        Ok(Arc::clone(&self.0))
    }
}

pub fn configured(name: &str, instance: Arc<dyn ProtocolInstance>) -> ConfiguredProtocol {
    ConfiguredProtocol {
        protocol: name.to_string(),
        remote: format!("{}-remote", name),
        instance,
    }
}

/// Multiplex an in-memory socket across `instances`, returning the peer end.
pub fn spawn_remote(
    instances: Vec<Arc<dyn ProtocolInstance>>,
) -> (Arc<RemoteConnection>, DuplexStream, Arc<Reporter>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (remote, reporter) = spawn_remote_on(server, instances);
    (remote, client, reporter)
}

/// Multiplex `socket` across `instances`, named `p0`, `p1`, ...
pub fn spawn_remote_on<S: Socket>(
    socket: S,
    instances: Vec<Arc<dyn ProtocolInstance>>,
) -> (Arc<RemoteConnection>, Arc<Reporter>) {
    let protocols: Vec<ConfiguredProtocol> = instances
        .into_iter()
        .enumerate()
        .map(|(i, instance)| configured(&format!("p{}", i), instance))
        .collect();
    let reporter = Arc::new(Reporter::new());
    let remote = RemoteConnection::spawn(
        socket,
        None,
        None,
        &protocols,
        RemoteContext {
            reporter: Arc::clone(&reporter),
            ..RemoteContext::default()
        },
    );
    (remote, reporter)
}

/// A socket that resets on read or on write. The side that does not fail
/// never yields data and accepts every write.
#[derive(Debug, Clone, Copy)]
pub struct BrokenSocket {
    pub fail_reads: bool,
    pub fail_writes: bool,
}

impl BrokenSocket {
    pub fn on_read() -> Self {
        Self {
            fail_reads: true,
            fail_writes: false,
        }
    }

    pub fn on_write() -> Self {
        Self {
            fail_reads: false,
            fail_writes: true,
        }
    }
}

impl AsyncRead for BrokenSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fail_reads {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        } else {
            Poll::Pending
        }
    }
}

impl AsyncWrite for BrokenSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        } else {
            Poll::Ready(Ok(buf.len()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Await `future`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
