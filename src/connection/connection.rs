use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::daemon::{self, error_name, Daemon};
use crate::error::ErrorKind;
use crate::export::{Dispatch, ExportObject, MethodReply, ObjectTree};
use crate::frame::{self, Head};
use crate::message::BusEvent;
use crate::proto::{Endianness, Flags, MessageType, PREFIX_LENGTH};
use crate::signal::{Condition, QueueCore, QueueState, SignalQueue};
use crate::{Error, Message, ObjectPath, Result, Signature, SignatureBuf, Value};

use super::MatchRegistry;

/// Queue capacity used for the built-in daemon signal subscription.
const DAEMON_QUEUE_SIZE: usize = 20;

/// The default capacity of a subscriber queue.
pub(crate) const DEFAULT_QUEUE_SIZE: usize = 4;

/// The body of a successful method reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub(crate) signature: SignatureBuf,
    pub(crate) body: Vec<Value>,
}

impl Reply {
    /// The signature of the reply body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The reply body values.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the reply body values.
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }
}

/// A slot resolving into the reply of an outstanding method call.
///
/// Returned by [`Connection::call`]; await it to obtain the reply. Once
/// returned, the slot is guaranteed to resolve: with the reply, a remote
/// error, or a no-reply error if the connection closes first. Dropping the
/// slot cancels interest; the reply is then discarded silently when it
/// arrives.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl PendingReply {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Reply>>) -> Self {
        Self { rx }
    }
}

impl Future for PendingReply {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(..)) => Poll::Ready(Err(Error::new(ErrorKind::NoReply))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct State {
    running: bool,
    serial: u32,
    pending: HashMap<u32, oneshot::Sender<Result<Reply>>>,
    queues: Vec<Arc<QueueCore>>,
    next_queue: u64,
    name: Option<String>,
    names: HashSet<String>,
}

struct Tasks {
    recv: Option<JoinHandle<()>>,
    daemon: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    endianness: Endianness,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: StdMutex<State>,
    pub(crate) matches: Mutex<MatchRegistry>,
    exports: StdMutex<ObjectTree>,
    /// Claimed by whichever side runs the teardown: a local `close` or the
    /// receive loop's EOF and fault paths.
    teardown: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    lost_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    tasks: StdMutex<Tasks>,
}

/// An asynchronous connection to a D-Bus message bus.
///
/// The connection owns the transport and multiplexes concurrent method
/// calls, signal subscriptions and exported objects over it. Cloning is
/// cheap and clones refer to the same connection.
///
/// # Examples
///
/// ```no_run
/// use busmux::Connection;
///
/// # #[tokio::main] async fn main() -> busmux::Result<()> {
/// let c = Connection::session_bus().await?;
/// assert!(c.name().is_some_and(|n| n.starts_with(':')));
/// c.close().await;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Shorthand for connecting to the session bus with the default
    /// configuration.
    pub async fn session_bus() -> Result<Self> {
        super::ConnectionBuilder::new().session_bus().build().await
    }

    /// Shorthand for connecting to the system bus with the default
    /// configuration.
    pub async fn system_bus() -> Result<Self> {
        super::ConnectionBuilder::new().system_bus().build().await
    }

    /// Construct a connection over an already authenticated stream.
    ///
    /// The stream must have completed the SASL handshake (or be a
    /// peer-authenticated socket pair); it speaks the binary D-Bus protocol
    /// from its first byte. The receive loop starts immediately. `Hello` is
    /// not issued; use the builder or [`connect_bus`] for that.
    ///
    /// [`connect_bus`]: super::connect_bus
    pub fn from_stream(stream: UnixStream) -> Connection {
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared {
            endianness: Endianness::NATIVE,
            writer: Mutex::new(Some(writer)),
            state: StdMutex::new(State {
                running: true,
                serial: 1,
                pending: HashMap::new(),
                queues: Vec::new(),
                next_queue: 1,
                name: None,
                names: HashSet::new(),
            }),
            matches: Mutex::new(MatchRegistry::new()),
            exports: StdMutex::new(ObjectTree::new()),
            teardown: AtomicBool::new(false),
            cancel_tx: watch::channel(false).0,
            lost_tx: watch::channel(false).0,
            done_tx: watch::channel(false).0,
            tasks: StdMutex::new(Tasks {
                recv: None,
                daemon: None,
            }),
        });

        let conn = Connection {
            shared: shared.clone(),
        };

        // The built-in subscription for signals originating from the bus
        // daemon itself. It needs no daemon-side AddMatch.
        let (mut daemon_queue, core) = SignalQueue::new(conn.clone(), 0, DAEMON_QUEUE_SIZE);
        daemon_queue.set_throw_done(false);
        core.push_condition(
            Condition::new()
                .sender(daemon::DESTINATION)
                .path(daemon::PATH.as_str())
                .interface(daemon::INTERFACE),
        );
        shared.state.lock().expect("state poisoned").queues.push(core);

        let recv = tokio::spawn(recv_loop(shared.clone(), reader));
        let daemon_task = tokio::spawn(daemon_signal_worker(conn.clone(), daemon_queue));

        {
            let mut tasks = shared.tasks.lock().expect("tasks poisoned");
            tasks.recv = Some(recv);
            tasks.daemon = Some(daemon_task);
        }

        conn
    }

    /// Post-authentication setup: issue `Hello` and record the unique name
    /// the daemon assigned.
    pub(crate) async fn setup(&self) -> Result<()> {
        let name = self.daemon().hello().await?;

        let mut st = self.shared.state.lock().expect("state poisoned");

        // NameAcquired may already have delivered the name.
        if st.name.is_none() {
            st.name = Some(name);
        }

        Ok(())
    }

    /// The primary bus name assigned at `Hello`, of the form `:X.Y`.
    pub fn name(&self) -> Option<String> {
        self.shared.state.lock().expect("state poisoned").name.clone()
    }

    /// All names currently held by this connection, including acquired
    /// well-known names.
    pub fn names(&self) -> Vec<String> {
        let st = self.shared.state.lock().expect("state poisoned");
        st.names.iter().cloned().collect()
    }

    /// Test if the connection is running.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().expect("state poisoned").running
    }

    /// Typed access to the bus daemon interface.
    pub fn daemon(&self) -> Daemon<'_> {
        Daemon::new(self)
    }

    fn next_serial(st: &mut State) -> NonZeroU32 {
        let serial = st.serial;
        st.serial = st.serial.wrapping_add(1);

        if st.serial == 0 {
            st.serial = 1;
        }

        NonZeroU32::new(serial).expect("serial counter skips zero")
    }

    /// Issue a method call.
    ///
    /// The reply slot is installed before any bytes are written, so a
    /// returned [`PendingReply`] always resolves eventually. Timeouts are
    /// the caller's responsibility: race the slot against a timer and drop
    /// it on expiry.
    pub async fn call(&self, message: Message) -> Result<PendingReply> {
        let (serial, rx) = {
            let mut st = self.shared.state.lock().expect("state poisoned");

            if !st.running {
                return Err(Error::new(ErrorKind::ConnectionClosed));
            }

            let serial = Self::next_serial(&mut st);
            let (tx, rx) = oneshot::channel();
            st.pending.insert(serial.get(), tx);
            (serial, rx)
        };

        let remove_slot = || {
            self.shared
                .state
                .lock()
                .expect("state poisoned")
                .pending
                .remove(&serial.get());
        };

        let bytes = match frame::serialize(&message, serial, self.shared.endianness) {
            Ok(bytes) => bytes,
            Err(error) => {
                remove_slot();
                return Err(error);
            }
        };

        if let Err(error) = self.write(&bytes).await {
            remove_slot();
            return Err(error);
        }

        Ok(PendingReply { rx })
    }

    /// Write a message without installing a reply slot. Used for signals
    /// and for replies to inbound calls.
    pub async fn send(&self, message: Message) -> Result<()> {
        let serial = {
            let mut st = self.shared.state.lock().expect("state poisoned");

            if !st.running {
                return Err(Error::new(ErrorKind::ConnectionClosed));
            }

            Self::next_serial(&mut st)
        };

        let bytes = frame::serialize(&message, serial, self.shared.endianness)?;
        self.write(&bytes).await
    }

    /// Write one serialized message as an atomic unit.
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;

        let Some(w) = writer.as_mut() else {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        };

        match w.write_all(bytes).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // A failure here may leave part of the message on the
                // stream, which is no longer trustable.
                drop(writer);
                self.shared.begin_teardown_detached();
                Err(error.into())
            }
        }
    }

    /// Create a new subscriber queue with the given capacity.
    pub fn new_queue(&self, qsize: usize) -> Result<SignalQueue> {
        let mut st = self.shared.state.lock().expect("state poisoned");

        if !st.running {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }

        let id = st.next_queue;
        st.next_queue += 1;

        let (queue, core) = SignalQueue::new(self.clone(), id, qsize);
        st.queues.push(core);
        Ok(queue)
    }

    pub(crate) fn remove_queue(&self, id: u64) {
        let mut st = self.shared.state.lock().expect("state poisoned");
        st.queues.retain(|q| q.id != id);
    }

    /// Install an object at the given path of the export tree.
    pub fn attach(&self, path: &ObjectPath, object: ExportObject) -> Result<()> {
        if !self.is_running() {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }

        self.shared
            .exports
            .lock()
            .expect("exports poisoned")
            .attach(path, object)
    }

    /// Clear the object attached at the given path.
    pub fn detach(&self, path: &ObjectPath) -> Result<()> {
        self.shared
            .exports
            .lock()
            .expect("exports poisoned")
            .detach(path)
    }

    /// Resolves when the connection is lost or closed.
    pub async fn lost(&self) {
        let mut rx = self.shared.lost_tx.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    /// Close the connection.
    ///
    /// Idempotent. Completes once the writer is closed, the receive loop
    /// has stopped, pending replies have failed with a no-reply error, each
    /// subscriber queue has taken its DONE sentinel, the daemon signal
    /// worker has stopped, and [`lost`] has resolved.
    ///
    /// [`lost`]: Connection::lost
    pub async fn close(&self) {
        if !self.shared.teardown.swap(true, Ordering::SeqCst) {
            self.shared.cancel_tx.send_replace(true);

            let recv = self.shared.tasks.lock().expect("tasks poisoned").recv.take();

            if let Some(handle) = recv {
                let _ = handle.await;
            }

            self.shared.teardown_inner().await;
        } else {
            let mut done = self.shared.done_tx.subscribe();
            let _ = done.wait_for(|done| *done).await;
        }
    }

    /// Handle one inbound method call to completion.
    async fn dispatch_call(&self, event: BusEvent) {
        let no_reply = event.flags & Flags::NO_REPLY_EXPECTED;

        let dispatch = self
            .shared
            .exports
            .lock()
            .expect("exports poisoned")
            .handle(&event);

        let outcome: Result<(SignatureBuf, Vec<Value>)> = match dispatch {
            Dispatch::Introspect(xml) => {
                Ok((Signature::STRING.to_owned(), vec![Value::from(xml)]))
            }
            Dispatch::Error { name, message } => {
                tracing::debug!("dispatch error {name}: {message}");

                if !no_reply {
                    if let Err(error) = self.send(event.error_reply(name, &message)).await {
                        tracing::debug!("failed to send error reply: {error}");
                    }
                }

                return;
            }
            Dispatch::Invoke {
                handler,
                args,
                result,
            } => {
                let reply = match handler(args) {
                    MethodReply::Ready(result) => result,
                    MethodReply::Future(future) => future.await,
                };

                reply.map(|values| (result, values))
            }
        };

        if no_reply {
            return;
        }

        let message = match outcome {
            Ok((signature, values)) => {
                match event.method_return().with_body(signature.as_str(), values) {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::debug!("method reply does not fit signature: {error}");
                        event.error_reply(error_name::FAILED, &error.to_string())
                    }
                }
            }
            Err(error) => {
                tracing::debug!("method handler failed: {error}");

                let name = error
                    .remote_name()
                    .unwrap_or(error_name::FAILED)
                    .to_owned();
                let text = error
                    .remote_message()
                    .map(str::to_owned)
                    .unwrap_or_else(|| error.to_string());

                event.error_reply(&name, &text)
            }
        };

        if let Err(error) = self.send(message).await {
            tracing::debug!("failed to send method reply: {error}");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Run the teardown from a context which must not block on it, such as
    /// a failed write inside an unrelated task.
    fn begin_teardown_detached(self: &Arc<Self>) {
        let shared = self.clone();

        tokio::spawn(async move {
            Connection { shared }.close().await;
        });
    }

    /// The common teardown: close the writer, fail pending replies,
    /// deliver DONE sentinels, join the daemon worker, resolve `lost`, and
    /// let any continuations run before reporting completion.
    async fn teardown_inner(&self) {
        self.writer.lock().await.take();

        let (pending, queues) = {
            let mut st = self.state.lock().expect("state poisoned");
            st.running = false;
            let pending = st.pending.drain().collect::<Vec<_>>();
            let queues = std::mem::take(&mut st.queues);
            (pending, queues)
        };

        for (_, slot) in pending {
            let _ = slot.send(Err(Error::new(ErrorKind::NoReply)));
        }

        for queue in queues {
            queue.deliver_done().await;
        }

        let daemon = self.tasks.lock().expect("tasks poisoned").daemon.take();

        if let Some(handle) = daemon {
            let _ = handle.await;
        }

        self.lost_tx.send_replace(true);
        tokio::task::yield_now().await;
        self.done_tx.send_replace(true);
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

async fn recv_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut cancel = shared.cancel_tx.subscribe();

    let result = loop {
        tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel) => break Ok(()),
            r = recv_one(&mut reader) => match r {
                Ok(Some(event)) => route(&shared, event).await,
                Ok(None) => break Ok(()),
                Err(error) => break Err(error),
            }
        }
    };

    match result {
        Ok(()) => tracing::debug!("receive loop done"),
        Err(error) => tracing::warn!("receive loop failed: {error}"),
    }

    // The EOF and fault paths tear the connection down from here; a local
    // close has already claimed the teardown and joins this task instead.
    if !shared.teardown.swap(true, Ordering::SeqCst) {
        shared.teardown_inner().await;
    }
}

/// Read one full message off the stream. A clean EOF at a message boundary
/// returns `None`.
async fn recv_one(reader: &mut OwnedReadHalf) -> Result<Option<BusEvent>> {
    let mut prefix = [0u8; PREFIX_LENGTH];

    match reader.read_exact(&mut prefix).await {
        Ok(..) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let head = Head::parse(&prefix)?;

    let mut bytes = vec![0u8; PREFIX_LENGTH + head.remaining()];
    bytes[..PREFIX_LENGTH].copy_from_slice(&prefix);
    reader.read_exact(&mut bytes[PREFIX_LENGTH..]).await?;

    Ok(Some(frame::deserialize(&head, &bytes)?))
}

async fn route(shared: &Arc<Shared>, event: BusEvent) {
    match event.message_type {
        MessageType::METHOD_RETURN | MessageType::ERROR => {
            resolve_reply(shared, event);
        }
        MessageType::SIGNAL => {
            let event = Arc::new(event);
            let queues = shared.state.lock().expect("state poisoned").queues.clone();
            let mut matched = false;

            for queue in &queues {
                matched |= queue.emit(&event);
            }

            if !matched {
                // This can happen naturally through races with RemoveMatch.
                tracing::debug!(member = ?event.member, "ignored signal");
            }
        }
        MessageType::METHOD_CALL => {
            let conn = Connection {
                shared: shared.clone(),
            };

            tokio::spawn(async move {
                conn.dispatch_call(event).await;
            });
        }
        other => {
            tracing::debug!("ignoring message of unknown type {other:?}");
        }
    }
}

fn resolve_reply(shared: &Shared, event: BusEvent) {
    let Some(reply_serial) = event.reply_serial else {
        return;
    };

    let slot = shared
        .state
        .lock()
        .expect("state poisoned")
        .pending
        .remove(&reply_serial.get());

    let Some(slot) = slot else {
        tracing::warn!("received reply with unknown serial {reply_serial}");
        return;
    };

    let result = if event.message_type == MessageType::ERROR {
        let name = event.error_name.as_deref().unwrap_or_default();

        if name == error_name::NO_REPLY {
            Err(Error::new(ErrorKind::NoReply))
        } else {
            let message = event
                .body
                .first()
                .and_then(Value::as_str)
                .map(Box::from);
            Err(Error::remote(name, message))
        }
    } else {
        Ok(Reply {
            signature: event.signature,
            body: event.body,
        })
    };

    // A failed send means the caller cancelled the slot; discard silently.
    let _ = slot.send(result);
}

/// Consume signals from the bus daemon, maintaining the connection's
/// primary and acquired name state.
async fn daemon_signal_worker(conn: Connection, mut queue: SignalQueue) {
    let mut last = QueueState::Normal;

    loop {
        let Ok((event, state)) = queue.recv().await else {
            return;
        };

        match state {
            QueueState::Done => return,
            QueueState::Oflow if last == QueueState::Normal => {
                tracing::warn!("missed some bus daemon signals");
            }
            _ => {}
        }

        last = state;

        let Some(event) = event else {
            continue;
        };

        match event.member() {
            Some("NameAcquired") => {
                let Some(name) = event.body().first().and_then(Value::as_str) else {
                    continue;
                };

                tracing::debug!("NameAcquired: {name}");

                let mut st = conn.shared.state.lock().expect("state poisoned");

                if st.name.is_none() {
                    st.name = Some(name.to_owned());
                }

                st.names.insert(name.to_owned());
            }
            Some("NameLost") => {
                let Some(name) = event.body().first().and_then(Value::as_str) else {
                    continue;
                };

                tracing::debug!("NameLost: {name}");
                conn.shared
                    .state
                    .lock()
                    .expect("state poisoned")
                    .names
                    .remove(name);
            }
            member => {
                tracing::debug!(?member, "daemon signal");
            }
        }
    }
}
