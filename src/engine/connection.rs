//! The per-protocol view of a shared physical connection.
//!
//! A protocol handler only ever sees a [`Connection`]. While other
//! candidates are still attached, reads are served from the fan-out buffer
//! and writes block until the write loop has put them on the wire. Once the
//! Connection is the last one left, both go straight to the socket.

use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::engine::remote::write_all_flushed;
use crate::engine::{ConnectionId, MuxError, RemoteConnection, Result};
use crate::framework::ConfiguredProtocol;
use crate::observability::metrics;

enum ReadStep {
    Copied { n: usize, drained: bool },
    Direct,
    Closed,
}

enum WriteStep {
    Written,
    Solo,
    Closed,
}

struct Handle {
    remote: Arc<RemoteConnection>,
    index: usize,
    protocol: String,
    remote_name: String,
    closed: AtomicBool,
}

/// Handle given to one protocol instance for one physical connection.
///
/// Cheap to clone; all clones refer to the same slot. Dropping the last
/// clone does not close the Connection, the owning task does that when the
/// handler returns.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Handle>,
}

impl Connection {
    pub(crate) fn new(
        remote: Arc<RemoteConnection>,
        index: usize,
        configured: &ConfiguredProtocol,
    ) -> Self {
        Self {
            inner: Arc::new(Handle {
                remote,
                index,
                protocol: configured.protocol.clone(),
                remote_name: configured.remote.clone(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Blocks until data is available. `Ok(0)` means the peer closed the
    /// stream; [`MuxError::Closed`] means this Connection was cut off.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let remote = &self.inner.remote;
        let index = self.inner.index;

        loop {
            let step = remote
                .wait_for(|m| {
                    if m.cut_off(index) {
                        return Some(ReadStep::Closed);
                    }
                    let shared = m.is_shared();
                    let pending = &mut m.slots[index].read;
                    if !pending.is_empty() {
                        let n = buf.len().min(pending.len());
                        buf[..n].copy_from_slice(&pending[..n]);
                        pending.advance(n);
                        return Some(ReadStep::Copied {
                            n,
                            drained: pending.is_empty(),
                        });
                    }
                    (!shared).then_some(ReadStep::Direct)
                })
                .await;

            match step {
                ReadStep::Closed => return Err(MuxError::Closed),
                ReadStep::Copied { n, drained } => {
                    if drained {
                        remote.broadcast();
                    }
                    return Ok(n);
                }
                ReadStep::Direct => {}
            }

            let mut reader = remote.reader().lock().await;
            {
                let monitor = remote.lock();
                if monitor.cut_off(index) {
                    return Err(MuxError::Closed);
                }
                if !monitor.slots[index].read.is_empty() {
                    // Delivered by the fan-out loop before it stepped aside.
                    continue;
                }
            }
            let Some(socket) = reader.as_mut() else {
                return Err(MuxError::Closed);
            };
            return tokio::select! {
                result = socket.read(buf) => result.map_err(MuxError::from),
                _ = remote.wait_until(|m| m.cut_off(index)) => Err(MuxError::Closed),
            };
        }
    }

    /// Write `data` to the peer.
    ///
    /// While other candidates are attached this blocks until the bytes are
    /// part of a prefix every candidate agreed on and has been sent. On
    /// success the whole of `data` has been accepted.
    ///
    /// Dropping the future before it completes withdraws whatever part of
    /// `data` is still queued.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let remote = &self.inner.remote;
        let index = self.inner.index;

        let seq = {
            let mut monitor = remote.lock();
            if monitor.cut_off(index) {
                return Err(MuxError::Closed);
            }
            monitor
                .is_shared()
                .then(|| monitor.queue_write(index, data))
        };

        let Some(seq) = seq else {
            self.write_direct(data, false).await?;
            return Ok(data.len());
        };
        let _queued = QueuedWrite {
            remote,
            index,
            seq,
        };
        remote.broadcast();

        let step = remote
            .wait_for(|m| {
                if m.cut_off(index) {
                    Some(WriteStep::Closed)
                } else if m.slots[index].write.is_empty() {
                    Some(WriteStep::Written)
                } else if !m.is_shared() {
                    Some(WriteStep::Solo)
                } else {
                    None
                }
            })
            .await;

        match step {
            WriteStep::Written => Ok(data.len()),
            WriteStep::Closed => Err(MuxError::Closed),
            WriteStep::Solo => {
                self.write_direct(data, true).await?;
                Ok(data.len())
            }
        }
    }

    /// Put bytes on the socket without going through the write loop.
    ///
    /// With `queued` set, only what is still queued in this slot is sent;
    /// the write loop may have flushed part of it before stepping aside.
    async fn write_direct(&self, data: &[u8], queued: bool) -> Result<()> {
        let remote = &self.inner.remote;
        let index = self.inner.index;

        let mut writer = remote.writer().lock().await;
        let remainder = {
            let mut monitor = remote.lock();
            if monitor.cut_off(index) {
                return Err(MuxError::Closed);
            }
            if queued {
                std::mem::take(&mut monitor.slots[index].write)
            } else {
                Bytes::copy_from_slice(data)
            }
        };
        if remainder.is_empty() {
            return Ok(());
        }
        let Some(socket) = writer.as_mut() else {
            return Err(MuxError::Closed);
        };
        tokio::select! {
            result = write_all_flushed(socket, &remainder) => result.map_err(MuxError::from),
            _ = remote.wait_until(|m| m.cut_off(index)) => Err(MuxError::Closed),
        }
    }

    /// Write all of `data`.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Fill `buf` completely, failing if the peer closes first.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Claim the physical connection for this protocol.
    ///
    /// Blocks until every live candidate has claimed. The highest priority
    /// wins, ties go to whoever claimed first. The winner returns `Ok` and
    /// is left alone on the socket once the losers have detached; losers
    /// are closed and get [`MuxError::Closed`].
    pub async fn require_exclusive(&self, priority: u32) -> Result<()> {
        let remote = &self.inner.remote;
        let index = self.inner.index;

        {
            let mut monitor = remote.lock();
            if monitor.cut_off(index) {
                return Err(MuxError::Closed);
            }
            monitor.claim(index, priority);
        }
        remote.broadcast();

        let won = remote
            .wait_for(|m| {
                if m.cut_off(index) {
                    return Some(None);
                }
                m.arbitrate().map(|winner| Some(winner == index))
            })
            .await;

        match won {
            Some(true) => {
                metrics::record_arbitration(true);
                tracing::debug!(
                    connection_id = %remote.id(),
                    protocol = %self.inner.protocol,
                    remote = %self.inner.remote_name,
                    priority,
                    "Protocol won exclusive access"
                );
                Ok(())
            }
            Some(false) => {
                metrics::record_arbitration(false);
                self.close();
                Err(MuxError::Closed)
            }
            None => Err(MuxError::Closed),
        }
    }

    /// Detach from the shared connection. Idempotent.
    ///
    /// Closing the last attached Connection closes the physical connection.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.remote.release(self.inner.index);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.remote.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.remote.peer_addr()
    }

    /// Identifier of the underlying physical connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.remote.id()
    }

    /// Position of this protocol instance in the service's candidate list.
    pub fn protocol_index(&self) -> usize {
        self.inner.index
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn remote_name(&self) -> &str {
        &self.inner.remote_name
    }

    pub fn set_deadline(&self, _deadline: tokio::time::Instant) -> Result<()> {
        Err(MuxError::DeadlinesNotSupported)
    }

    pub fn set_read_deadline(&self, _deadline: tokio::time::Instant) -> Result<()> {
        Err(MuxError::DeadlinesNotSupported)
    }

    pub fn set_write_deadline(&self, _deadline: tokio::time::Instant) -> Result<()> {
        Err(MuxError::DeadlinesNotSupported)
    }
}

/// Withdraws a queued write when its `write` call goes away.
struct QueuedWrite<'a> {
    remote: &'a RemoteConnection,
    index: usize,
    seq: u64,
}

impl Drop for QueuedWrite<'_> {
    fn drop(&mut self) {
        self.remote.lock().abandon_write(self.index, self.seq);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id())
            .field("protocol", &self.inner.protocol)
            .field("remote", &self.inner.remote_name)
            .field("index", &self.inner.index)
            .finish()
    }
}
