//! The protocol connection: handshake, pipelined commands, dispatch.
//!
//! A [`Connection`] owns a Unix-socket session with the daemon. Commands
//! are pipelined head-of-line: at most one command is on the wire awaiting
//! its response, and responses are matched to commands purely by arrival
//! order. Server-pushed ("unilateral") messages are recognized by marker
//! keys and delivered to an optional subscriber channel without disturbing
//! command ordering.
//!
//! Internally the connection is an `Arc`'d state block shared with two
//! tasks: a read loop that feeds the receive buffer and triggers dispatch,
//! and a writer task that owns the socket's write half. One mutex guards
//! the queue, buffer, and lifecycle flags; it is never held across a
//! completion delivery or a socket write, so a result handler may call
//! [`Connection::run`] reentrantly.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::PduBuffer;
use crate::error::{Error, Result};
use crate::pdu::{self, map_get, Value, DEFAULT_MAX_PDU_SIZE};
use crate::queue::CommandQueue;
use crate::sockpath;

/// Marker keys identifying a unilateral message, ordered with the most
/// frequent kind first.
const UNILATERAL_KEYS: [&str; 2] = ["subscription", "log"];

/// Error detail synthesized when the version response carries no
/// `"capabilities"` key.
const CAPABILITIES_UPGRADE_MSG: &str =
    "this watchd server has no support for capabilities, \
     please upgrade to the current stable version";

/// What the subscriber channel carries: `Ok` per unilateral event, one
/// final `Err` when the connection breaks for a non-close reason.
pub type Notification = Result<Value>;

/// Connection lifecycle states. `Broken` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Connecting,
    Negotiating,
    Ready,
    Closing,
    Broken,
    Closed,
}

/// Builder for configuring a [`Connection`].
pub struct ConnectionBuilder {
    sock_path: Option<PathBuf>,
    subscriber: Option<mpsc::UnboundedSender<Notification>>,
    max_pdu_size: usize,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            sock_path: None,
            subscriber: None,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }

    /// Use this socket path instead of discovering one.
    pub fn sock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sock_path = Some(path.into());
        self
    }

    /// Install the subscriber for unilateral events. Without one, any
    /// unilateral message breaks the connection.
    pub fn subscriber(mut self, tx: mpsc::UnboundedSender<Notification>) -> Self {
        self.subscriber = Some(tx);
        self
    }

    /// Cap on a single incoming message body.
    pub fn max_pdu_size(mut self, max: usize) -> Self {
        self.max_pdu_size = max;
        self
    }

    pub fn build(self) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: State::Created,
                    queue: CommandQueue::new(),
                    buffer: PduBuffer::with_max_pdu_size(self.max_pdu_size),
                    broken: false,
                    closing: false,
                    decoding: false,
                    sock_path: self.sock_path,
                    subscriber: self.subscriber,
                    writer: None,
                    read_task: None,
                    write_task: None,
                }),
            }),
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection to the watchd daemon.
///
/// Dropping the connection closes it; pending commands fail with
/// [`Error::Closed`].
pub struct Connection {
    inner: Arc<Inner>,
}

/// State shared between the caller, the read loop, and the writer task.
/// One lock covers all of it; held only for mutation, never across a
/// write or a completion delivery.
struct Shared {
    state: State,
    queue: CommandQueue,
    buffer: PduBuffer,
    broken: bool,
    closing: bool,
    /// Single-flight guard for the dispatch pass.
    decoding: bool,
    sock_path: Option<PathBuf>,
    subscriber: Option<mpsc::UnboundedSender<Notification>>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

struct Inner {
    shared: Mutex<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Connect to the daemon and negotiate capabilities.
    ///
    /// `args` must be a map; it is sent as `["version", args]` before any
    /// other command. The returned value is the version response, which is
    /// required to carry a `"capabilities"` key — a server too old to
    /// report capabilities fails the connect even though the transport
    /// connected.
    pub async fn connect(&self, args: Value) -> Result<Value> {
        if !args.is_map() {
            return Err(Error::Usage(
                "handshake arguments must be a map".to_owned(),
            ));
        }

        let explicit = {
            let mut shared = self.inner.lock();
            if shared.state != State::Created {
                return Err(Error::Usage(
                    "connect() may only be called once".to_owned(),
                ));
            }
            shared.state = State::Connecting;
            shared.sock_path.take()
        };

        let path = match sockpath::resolve(explicit).await {
            Ok(path) => path,
            Err(e) => {
                self.inner.mark_broken();
                return Err(e);
            }
        };
        let stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.mark_broken();
                return Err(Error::Connect(format!(
                    "failed to connect to {}: {e}",
                    path.display()
                )));
            }
        };
        tracing::debug!(path = %path.display(), "transport connected, negotiating");

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.inner.lock();
            if shared.closing || shared.broken {
                return Err(Error::Closed);
            }
            shared.state = State::Negotiating;
            shared.writer = Some(writer_tx);
            shared.write_task = Some(tokio::spawn(write_loop(
                self.inner.clone(),
                writer_rx,
                write_half,
            )));
            shared.read_task = Some(tokio::spawn(read_loop(self.inner.clone(), read_half)));
        }

        // A server-reported "error" surfaces here as Error::Response and is
        // propagated untouched; the upgrade message below is only attached
        // to responses that had no error of their own.
        let response = self
            .run(Value::Array(vec![Value::from("version"), args]))
            .await?;

        if map_get(&response, "capabilities").is_some() {
            let mut shared = self.inner.lock();
            if shared.state == State::Negotiating {
                shared.state = State::Ready;
            }
            tracing::debug!("capability negotiation complete");
            return Ok(response);
        }

        let mut value = response;
        if let Value::Map(ref mut entries) = value {
            entries.push((
                Value::from("error"),
                Value::from(CAPABILITIES_UPGRADE_MSG),
            ));
        }
        Err(Error::Response(value))
    }

    /// Issue a command and await its response.
    ///
    /// Thread-safe and callable from any task, including from a task that
    /// is itself handling a previous command's result. Fails immediately
    /// if the connection is broken or was never connected.
    pub async fn run(&self, command: Value) -> Result<Value> {
        let rx = self.inner.enqueue(command)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(
                "connection dropped before the response arrived".to_owned(),
            )),
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// All pending commands fail with [`Error::Closed`]; the subscriber is
    /// not notified, since an intentional shutdown is not a surprise
    /// disconnect.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode and enqueue a command, triggering a send if the queue was
    /// empty. Returns the receiver for the command's result slot.
    fn enqueue(&self, command: Value) -> Result<oneshot::Receiver<Result<Value>>> {
        let payload = pdu::encode(&command)?;
        let (tx, rx) = oneshot::channel();

        let should_send = {
            let mut shared = self.lock();
            if shared.broken {
                return Err(Error::Usage("the connection is broken".to_owned()));
            }
            if shared.writer.is_none() {
                return Err(Error::Usage(
                    "not connected (call connect() and check its result)".to_owned(),
                ));
            }
            let was_empty = shared.queue.push(payload, tx);
            tracing::trace!(depth = shared.queue.len(), "command enqueued");
            was_empty
        };

        if should_send {
            self.send_head(false);
        }
        Ok(rx)
    }

    /// Hand the head command's payload to the writer task. With `pop`, the
    /// just-completed head is discarded first. This is the only place a
    /// write is initiated, which is what keeps at most one command on the
    /// wire.
    fn send_head(&self, pop: bool) {
        let handoff = {
            let mut shared = self.lock();
            if pop {
                shared.queue.pop_head();
            }
            match (shared.queue.head_payload(), shared.writer.clone()) {
                (Some(payload), Some(writer)) => Some((payload, writer)),
                _ => None,
            }
        };
        if let Some((payload, writer)) = handoff {
            if writer.send(payload).is_err() {
                self.fail_all(Error::Transport("writer task has exited".to_owned()));
            }
        }
    }

    /// Drain complete PDUs from the buffer, decoding and dispatching each.
    ///
    /// Single-flight: only one pass runs per connection, so results and
    /// events are delivered in wire order even when triggers race. The
    /// `decoding` flag is cleared under the same lock acquisition that
    /// observes an exhausted buffer, so bytes appended by a concurrent read
    /// are either seen by this pass or by the pass its trigger starts. On a
    /// failure exit the flag is released only after `fail_all` has drained
    /// the queue, so a racing pass cannot fulfill a command that the
    /// failure is about to fail.
    fn dispatch(&self) {
        {
            let mut shared = self.lock();
            if shared.decoding || shared.broken {
                return;
            }
            shared.decoding = true;
        }

        loop {
            let body = {
                let mut shared = self.lock();
                match shared.buffer.split_next() {
                    Ok(Some(body)) => body,
                    Ok(None) => {
                        shared.decoding = false;
                        return;
                    }
                    Err(e) => {
                        drop(shared);
                        self.fail_all(e);
                        self.end_dispatch();
                        return;
                    }
                }
            };

            let value = match pdu::decode_body(&body) {
                Ok(value) => value,
                Err(e) => {
                    self.fail_all(e);
                    self.end_dispatch();
                    return;
                }
            };

            if UNILATERAL_KEYS.iter().any(|k| map_get(&value, k).is_some()) {
                let subscriber = self.lock().subscriber.clone();
                let delivered = match subscriber {
                    Some(tx) => tx.send(response_to_result(value)).is_ok(),
                    None => false,
                };
                if delivered {
                    continue;
                }
                // No subscriber (or its receiver is gone): usage error.
                self.fail_all(Error::Protocol(
                    "unilateral event received but no subscriber is installed".to_owned(),
                ));
                self.end_dispatch();
                return;
            }

            // A command response belongs to the oldest queued command.
            let tx = {
                let mut shared = self.lock();
                if shared.queue.is_empty() {
                    None
                } else {
                    shared.queue.take_head_tx()
                }
            };
            match tx {
                Some(tx) => {
                    // Deliver outside the lock: the receiver may call run()
                    // again before we pop and send the next command.
                    let _ = tx.send(response_to_result(value));
                    self.send_head(true);
                }
                None => {
                    self.fail_all(Error::Protocol(
                        "response received but no command is queued".to_owned(),
                    ));
                    self.end_dispatch();
                    return;
                }
            }
        }
    }

    fn end_dispatch(&self) {
        self.lock().decoding = false;
    }

    /// Mark the connection broken before any transport session existed.
    /// Nothing can be queued yet, so there is no fan-out; the error
    /// reaches the caller through `connect()`'s result.
    fn mark_broken(&self) {
        let mut shared = self.lock();
        shared.broken = true;
        if !matches!(shared.state, State::Broken | State::Closed) {
            shared.state = State::Broken;
        }
    }

    /// Failure funnel: mark the connection broken, fail every pending
    /// command with `error`, and notify the subscriber exactly once unless
    /// the failure was a caller-initiated close.
    fn fail_all(&self, error: Error) {
        let (pending, subscriber) = {
            let mut shared = self.lock();
            shared.broken = true;
            if !matches!(shared.state, State::Broken | State::Closed) {
                shared.state = if shared.closing {
                    State::Closed
                } else {
                    State::Broken
                };
            }
            let pending = shared.queue.drain();
            let subscriber = if shared.closing {
                None
            } else {
                shared.subscriber.take()
            };
            (pending, subscriber)
        };

        if !pending.is_empty() {
            tracing::warn!(pending = pending.len(), %error, "failing queued commands");
        }
        for tx in pending {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = subscriber {
            let _ = tx.send(Err(error));
        }
    }

    fn close(&self) {
        let (writer, read_task) = {
            let mut shared = self.lock();
            if shared.closing {
                return;
            }
            shared.closing = true;
            if !matches!(shared.state, State::Broken | State::Closed) {
                shared.state = State::Closing;
            }
            shared.write_task.take();
            (shared.writer.take(), shared.read_task.take())
        };

        // Closing the channel lets the writer task drain and shut the
        // socket down; the read loop is torn down immediately.
        drop(writer);
        if let Some(task) = read_task {
            task.abort();
        }
        self.fail_all(Error::Closed);
    }
}

/// A decoded value carrying an `"error"` key is a failure by protocol
/// convention.
fn response_to_result(value: Value) -> Result<Value> {
    if map_get(&value, "error").is_some() {
        Err(Error::Response(value))
    } else {
        Ok(value)
    }
}

/// Read loop: feed the receive buffer and trigger a dispatch pass per read
/// event. Decoding runs on its own task so a slow decode never blocks the
/// socket read path.
async fn read_loop(inner: Arc<Inner>, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("peer closed the connection");
                inner.fail_all(Error::Transport("connection closed by peer".to_owned()));
                return;
            }
            Ok(n) => {
                inner.lock().buffer.extend(&buf[..n]);
                let inner = inner.clone();
                tokio::spawn(async move { inner.dispatch() });
            }
            Err(e) => {
                tracing::error!(error = %e, "socket read failed");
                inner.fail_all(e.into());
                return;
            }
        }
    }
}

/// Writer task: owns the write half; one queued payload at a time arrives
/// over the channel. A write failure funnels into `fail_all`.
async fn write_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut write_half: OwnedWriteHalf,
) {
    while let Some(payload) = rx.recv().await {
        let result = async {
            write_half.write_all(&payload).await?;
            write_half.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "socket write failed");
            inner.fail_all(e.into());
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
