//! One physical connection shared by several candidate protocols.
//!
//! # Responsibilities
//! - Own the socket and the shrinking live set of Connections attached to it
//! - Fan every physical read out to all live Connections (read loop)
//! - Put only the common prefix of pending writes on the wire (write loop)
//! - Resolve exclusivity claims into exactly one survivor
//! - Tear everything down exactly once
//!
//! # States
//! ```text
//! Open (live > 1) → Resolving (claims in flight) → Solo (live = 1) → Closed
//! ```
//!
//! # Design Decisions
//! - One std Mutex guards all shared state; a Notify is the broadcast
//!   condition. Waiters register before they inspect state, so a broadcast
//!   between check and sleep is never lost.
//! - The lock is never held across an await. Socket halves sit behind
//!   async mutexes and are driven with the monitor released.
//! - While the live set exceeds one, only the two loops touch the socket.

use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, OnceCell, OwnedSemaphorePermit};
use tokio::task::JoinHandle;

use crate::engine::{Connection, ConnectionId, MuxError, RemoteTracker, Reporter};
use crate::framework::ConfiguredProtocol;

/// Size of the scratch buffer used for each physical read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Any duplex byte stream the engine can multiplex.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Socket for T {}

pub(crate) type BoxedSocket = Box<dyn Socket>;

/// Observable phase of a RemoteConnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Several candidates, nobody has claimed exclusivity yet.
    Open,
    /// Several candidates, at least one exclusivity claim pending.
    Resolving,
    /// One candidate left; it talks to the socket directly.
    Solo,
    /// Terminal.
    Closed,
}

/// A common prefix plus the pending writes it was computed from.
#[derive(Debug)]
struct Outgoing {
    bytes: Bytes,
    sources: Vec<(usize, u64)>,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    priority: u32,
    order: u64,
}

/// Per-Connection state kept inside the monitor.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    /// Delivered from the socket, not yet consumed by this protocol.
    pub(crate) read: Bytes,
    /// Queued by a blocked `write`, not yet on the wire.
    pub(crate) write: Bytes,
    /// Bumped whenever `write` is replaced, withdrawn or released.
    write_seq: u64,
    claim: Option<Claim>,
    released: bool,
}

/// Everything guarded by the RemoteConnection monitor.
#[derive(Debug)]
pub(crate) struct Monitor {
    closed: bool,
    live: Vec<usize>,
    pub(crate) slots: Vec<Slot>,
    claims: u64,
    winner: Option<usize>,
}

impl Monitor {
    fn new(candidates: usize) -> Self {
        Self {
            closed: false,
            live: (0..candidates).collect(),
            slots: (0..candidates).map(|_| Slot::default()).collect(),
            claims: 0,
            winner: None,
        }
    }

    /// More than one candidate still attached.
    pub(crate) fn is_shared(&self) -> bool {
        self.live.len() > 1
    }

    /// The given Connection can no longer make progress.
    pub(crate) fn cut_off(&self, index: usize) -> bool {
        self.closed || self.slots[index].released
    }

    fn all_reads_drained(&self) -> bool {
        self.live.iter().all(|&i| self.slots[i].read.is_empty())
    }

    fn deliver(&mut self, chunk: &Bytes) {
        let Monitor { live, slots, .. } = self;
        for &i in live.iter() {
            slots[i].read = chunk.clone();
        }
    }

    /// Longest byte sequence every live Connection queues identically.
    fn common_write_prefix(&self) -> Bytes {
        let mut pending = self.live.iter().map(|&i| &self.slots[i].write);
        let Some(first) = pending.next() else {
            return Bytes::new();
        };
        let mut len = first.len();
        for other in pending {
            len = first[..len.min(other.len())]
                .iter()
                .zip(other.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if len == 0 {
                break;
            }
        }
        first.slice(..len)
    }

    fn outgoing(&self) -> Outgoing {
        Outgoing {
            bytes: self.common_write_prefix(),
            sources: self
                .live
                .iter()
                .map(|&i| (i, self.slots[i].write_seq))
                .collect(),
        }
    }

    /// Trim `written` bytes from every pending write `outgoing` was built
    /// from. Writes republished or withdrawn since then are left alone.
    fn consume_written(&mut self, outgoing: &Outgoing, written: usize) {
        for &(i, seq) in &outgoing.sources {
            let slot = &mut self.slots[i];
            if slot.write_seq != seq {
                continue;
            }
            let n = written.min(slot.write.len());
            slot.write.advance(n);
        }
    }

    /// Publish `data` as the pending write of `index`, returning its
    /// sequence number.
    pub(crate) fn queue_write(&mut self, index: usize, data: &[u8]) -> u64 {
        let slot = &mut self.slots[index];
        slot.write_seq += 1;
        slot.write = Bytes::copy_from_slice(data);
        slot.write_seq
    }

    /// Withdraw whatever is left of the write published as `seq`.
    pub(crate) fn abandon_write(&mut self, index: usize, seq: u64) {
        let slot = &mut self.slots[index];
        if slot.write_seq == seq && !slot.write.is_empty() {
            slot.write = Bytes::new();
            slot.write_seq += 1;
        }
    }

    pub(crate) fn claim(&mut self, index: usize, priority: u32) {
        self.slots[index].claim = Some(Claim {
            priority,
            order: self.claims,
        });
        self.claims += 1;
    }

    /// The arbitration winner, once every live Connection has claimed.
    ///
    /// The first decision is final so a winner that finishes early cannot
    /// hand the connection to a loser that has not yet noticed it lost.
    pub(crate) fn arbitrate(&mut self) -> Option<usize> {
        if self.winner.is_some() {
            return self.winner;
        }
        let mut best: Option<(usize, Claim)> = None;
        for &i in &self.live {
            let claim = self.slots[i].claim?;
            let better = match best {
                None => true,
                Some((_, current)) => {
                    claim.priority > current.priority
                        || (claim.priority == current.priority && claim.order < current.order)
                }
            };
            if better {
                best = Some((i, claim));
            }
        }
        self.winner = best.map(|(i, _)| i);
        self.winner
    }

    fn release(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        if slot.released {
            return false;
        }
        slot.released = true;
        slot.read = Bytes::new();
        slot.write = Bytes::new();
        slot.write_seq += 1;
        self.live.retain(|&i| i != index);
        true
    }

    fn state(&self) -> RemoteState {
        match self.live.len() {
            _ if self.closed => RemoteState::Closed,
            0 => RemoteState::Closed,
            1 => RemoteState::Solo,
            _ if self.live.iter().any(|&i| self.slots[i].claim.is_some()) => {
                RemoteState::Resolving
            }
            _ => RemoteState::Open,
        }
    }
}

/// Resources a RemoteConnection reports to and returns on teardown.
#[derive(Default)]
pub struct RemoteContext {
    pub reporter: Arc<Reporter>,
    pub tracker: Option<Arc<RemoteTracker>>,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// A physical connection multiplexed across candidate protocols.
pub struct RemoteConnection {
    id: ConnectionId,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    monitor: Mutex<Monitor>,
    changed: Notify,
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxedSocket>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    teardown: OnceCell<()>,
    finished: AtomicBool,
    reporter: Arc<Reporter>,
    tracker: Weak<RemoteTracker>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl RemoteConnection {
    /// Wrap `socket` and start one task per protocol plus the read and
    /// write loops.
    pub fn spawn<S: Socket>(
        socket: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        protocols: &[ConfiguredProtocol],
        context: RemoteContext,
    ) -> Arc<Self> {
        let boxed: BoxedSocket = Box::new(socket);
        let (reader, writer) = tokio::io::split(boxed);
        let remote = Arc::new(Self {
            id: ConnectionId::new(),
            local_addr,
            peer_addr,
            monitor: Mutex::new(Monitor::new(protocols.len())),
            changed: Notify::new(),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            tasks: Mutex::new(Vec::with_capacity(protocols.len() + 2)),
            teardown: OnceCell::new(),
            finished: AtomicBool::new(false),
            reporter: context.reporter,
            tracker: context
                .tracker
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
            permit: Mutex::new(context.permit),
        });
        if let Some(tracker) = &context.tracker {
            tracker.insert(Arc::clone(&remote));
        }

        tracing::debug!(
            connection_id = %remote.id,
            peer_addr = ?peer_addr,
            candidates = protocols.len(),
            "Remote connection opened"
        );

        // Hold the task list while spawning so teardown cannot take it half-filled.
        let mut tasks = remote.tasks.lock().expect("remote task list poisoned");
        for (index, configured) in protocols.iter().enumerate() {
            let conn = Connection::new(Arc::clone(&remote), index, configured);
            let instance = Arc::clone(&configured.instance);
            tasks.push(tokio::spawn(async move {
                let _guard = CloseOnDrop(conn.clone());
                match instance.handle(conn.clone()).await {
                    Ok(()) => tracing::debug!(
                        connection_id = %conn.connection_id(),
                        protocol = %conn.protocol(),
                        remote = %conn.remote_name(),
                        "Protocol session finished"
                    ),
                    Err(e) => tracing::trace!(
                        connection_id = %conn.connection_id(),
                        protocol = %conn.protocol(),
                        error = %e,
                        "Protocol handler ended"
                    ),
                }
            }));
        }
        tasks.push(tokio::spawn(Arc::clone(&remote).fan_out_reads()));
        tasks.push(tokio::spawn(Arc::clone(&remote).reconcile_writes()));
        drop(tasks);

        if protocols.is_empty() {
            remote.close_in_background();
        }
        remote
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Number of candidates still attached.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn state(&self) -> RemoteState {
        self.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once teardown has joined every task.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Close the socket, wake every blocked Connection, wait for the live
    /// set to drain and all tasks to exit, then leave the owning tracker.
    ///
    /// Safe to call repeatedly and concurrently; every caller returns once
    /// the single teardown has completed.
    pub async fn close(&self) {
        self.teardown.get_or_init(|| self.tear_down()).await;
    }

    async fn tear_down(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();

        if let Some(mut socket) = self.writer.lock().await.take() {
            if let Err(e) = socket.shutdown().await {
                self.reporter.non_critical(&MuxError::Io(e));
            }
        }
        self.reader.lock().await.take();

        self.wait_until(|m| m.live.is_empty()).await;

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("remote task list poisoned"));
        for task in tasks {
            if let Err(e) = task.await {
                self.reporter
                    .non_critical(&MuxError::Protocol(format!("connection task failed: {}", e)));
            }
        }

        self.permit.lock().expect("remote permit poisoned").take();
        self.finished.store(true, Ordering::SeqCst);
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.release(self.id);
        }
        tracing::debug!(connection_id = %self.id, "Remote connection closed");
    }

    fn close_in_background(self: &Arc<Self>) {
        let remote = Arc::clone(self);
        tokio::spawn(async move { remote.close().await });
    }

    /// Detach a Connection from the live set.
    pub(crate) fn release(self: &Arc<Self>, index: usize) {
        let (released, drained) = {
            let mut monitor = self.lock();
            let released = monitor.release(index);
            (released, monitor.live.is_empty() && !monitor.closed)
        };
        if !released {
            return;
        }
        self.changed.notify_waiters();
        if drained {
            self.close_in_background();
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Monitor> {
        self.monitor.lock().expect("remote connection monitor poisoned")
    }

    pub(crate) fn broadcast(&self) {
        self.changed.notify_waiters();
    }

    /// Run `step` under the monitor until it yields a value, sleeping on
    /// the broadcast condition in between.
    pub(crate) async fn wait_for<T>(&self, mut step: impl FnMut(&mut Monitor) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = {
                let mut monitor = self.lock();
                step(&mut *monitor)
            };
            if let Some(value) = outcome {
                return value;
            }
            notified.await;
        }
    }

    pub(crate) async fn wait_until(&self, ready: impl Fn(&Monitor) -> bool) {
        self.wait_for(|m| ready(&*m).then_some(())).await
    }

    pub(crate) fn reader(&self) -> &tokio::sync::Mutex<Option<ReadHalf<BoxedSocket>>> {
        &self.reader
    }

    pub(crate) fn writer(&self) -> &tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>> {
        &self.writer
    }

    async fn fan_out_reads(self: Arc<Self>) {
        let mut scratch = vec![0u8; READ_BUFFER_SIZE];
        loop {
            // The slowest candidate holds back the next physical read.
            if !self.wait_for(read_gate).await {
                break;
            }

            let mut reader = self.reader.lock().await;
            // A solo reader may have held the half while we queued for it.
            match read_gate(&mut *self.lock()) {
                Some(true) => {}
                Some(false) => break,
                None => continue,
            }
            let Some(socket) = reader.as_mut() else {
                break;
            };
            let outcome = tokio::select! {
                result = socket.read(&mut scratch) => Some(result),
                _ = self.wait_until(|m| m.closed || !m.is_shared()) => None,
            };

            match outcome {
                None => break,
                Some(Ok(0)) => {
                    tracing::debug!(connection_id = %self.id, "Peer closed the stream");
                    self.close_in_background();
                    break;
                }
                Some(Ok(n)) => {
                    let chunk = Bytes::copy_from_slice(&scratch[..n]);
                    self.lock().deliver(&chunk);
                    drop(reader);
                    self.changed.notify_waiters();
                }
                Some(Err(e)) => {
                    self.reporter.normal(&MuxError::Io(e));
                    self.close_in_background();
                    break;
                }
            }
        }
        tracing::trace!(connection_id = %self.id, "Read fan-out loop finished");
    }

    async fn reconcile_writes(self: Arc<Self>) {
        loop {
            if self.wait_for(write_gate).await.is_none() {
                break;
            }

            let mut writer = self.writer.lock().await;
            // Recompute under the half: a solo writer may have taken its
            // remainder while we queued for it.
            let outgoing = match write_gate(&mut *self.lock()) {
                Some(Some(outgoing)) => outgoing,
                Some(None) => break,
                None => continue,
            };
            let Some(socket) = writer.as_mut() else {
                break;
            };
            let outcome = tokio::select! {
                result = write_once(socket, &outgoing.bytes) => Some(result),
                _ = self.wait_until(|m| m.closed) => None,
            };

            match outcome {
                None => break,
                Some(Ok(n)) => {
                    tracing::trace!(connection_id = %self.id, bytes = n, "Wrote common prefix");
                    self.lock().consume_written(&outgoing, n);
                    drop(writer);
                    self.changed.notify_waiters();
                }
                Some(Err(e)) => {
                    self.reporter.normal(&MuxError::Io(e));
                    self.close_in_background();
                    break;
                }
            }
        }
        tracing::trace!(connection_id = %self.id, "Write reconciliation loop finished");
    }
}

/// `Some(true)` when every live buffer is drained, `Some(false)` once the
/// loop has no more work.
fn read_gate(m: &mut Monitor) -> Option<bool> {
    if m.closed || !m.is_shared() {
        Some(false)
    } else if m.all_reads_drained() {
        Some(true)
    } else {
        None
    }
}

/// The next prefix to send, or `Some(None)` once the loop has no more work.
fn write_gate(m: &mut Monitor) -> Option<Option<Outgoing>> {
    if m.closed || !m.is_shared() {
        return Some(None);
    }
    let outgoing = m.outgoing();
    (!outgoing.bytes.is_empty()).then_some(Some(outgoing))
}

async fn write_once(socket: &mut WriteHalf<BoxedSocket>, bytes: &[u8]) -> io::Result<usize> {
    let n = socket.write(bytes).await?;
    if n == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    socket.flush().await?;
    Ok(n)
}

pub(crate) async fn write_all_flushed(
    socket: &mut WriteHalf<BoxedSocket>,
    bytes: &[u8],
) -> io::Result<()> {
    socket.write_all(bytes).await?;
    socket.flush().await
}

/// Releases a Connection when its protocol task ends, even by panic.
struct CloseOnDrop(Connection);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
