//! Signal matching conditions and subscriber queues.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::error::ErrorKind;
use crate::message::BusEvent;
use crate::proto::MessageType;
use crate::{Connection, Error, Result};

/// The delivery state attached to each received tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Normal operation.
    Normal,
    /// The queue overflowed; at least one signal was dropped since the last
    /// successful delivery.
    Oflow,
    /// The queue was closed.
    Done,
}

/// A tuple delivered out of a [`SignalQueue`].
pub type QueueItem = (Option<Arc<BusEvent>>, QueueState);

/// Escape a value for use in a match expression.
///
/// Values are single-quoted; embedded single quotes use the `'\''` form.
pub(crate) fn escape_match(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{value}'");
    }

    let mut out = String::new();
    let mut run = String::new();

    for c in value.chars() {
        if c == '\'' {
            if !run.is_empty() {
                out.push('\'');
                out.push_str(&run);
                out.push('\'');
                run.clear();
            }

            out.push_str("\\'");
        } else {
            run.push(c);
        }
    }

    if !run.is_empty() {
        out.push('\'');
        out.push_str(&run);
        out.push('\'');
    }

    out
}

/// A signal matching condition.
///
/// Each field may be unset (wildcard) or set to match exactly;
/// `path_namespace` matches by path prefix. A condition serializes to the
/// canonical D-Bus match expression.
///
/// # Examples
///
/// ```
/// use busmux::Condition;
///
/// let cond = Condition::new().interface("foo.bar").member("Testing");
/// assert_eq!(cond.expr(), "interface='foo.bar',member='Testing'");
///
/// // A trailing `/*` on the path converts into a namespace match.
/// let cond = Condition::new().path("/a/*");
/// assert_eq!(cond.expr(), "path_namespace='/a'");
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Condition {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
}

impl Condition {
    /// Construct a condition matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match only signals.
    #[must_use]
    pub fn signals(mut self) -> Self {
        self.message_type = Some(MessageType::SIGNAL);
        self
    }

    /// Match the origin of the signal. Must be a unique bus name or the
    /// daemon's own name; other well-known names never match since the
    /// daemon rewrites senders to unique names.
    #[must_use]
    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Match the interface the signal was emitted from.
    #[must_use]
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    /// Match the signal member name.
    #[must_use]
    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_owned());
        self
    }

    /// Match the object path the signal was emitted from.
    ///
    /// A path ending in `/*` is translated into a namespace match on the
    /// prefix before it.
    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        match path.strip_suffix("/*") {
            Some(namespace) => {
                self.path_namespace = Some(namespace.to_owned());
            }
            None => {
                self.path = Some(path.to_owned());
            }
        }

        self
    }

    /// Match every path equal to or below the given namespace.
    #[must_use]
    pub fn path_namespace(mut self, namespace: &str) -> Self {
        self.path_namespace = Some(namespace.to_owned());
        self
    }

    /// Match the destination of the signal.
    #[must_use]
    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_owned());
        self
    }

    /// Validate the condition before registering it with the daemon.
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(sender) = &self.sender {
            if sender != crate::daemon::DESTINATION && !sender.starts_with(':') {
                return Err(Error::new(ErrorKind::WellKnownSender(
                    sender.as_str().into(),
                )));
            }
        }

        Ok(())
    }

    /// Test the condition against an event.
    ///
    /// Every specified field must be equal, or for `path_namespace`, the
    /// event path must sit at or below the namespace.
    pub fn test(&self, event: &BusEvent) -> bool {
        if let Some(message_type) = self.message_type {
            if event.message_type != message_type {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if event.sender.as_deref() != Some(sender.as_str()) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if event.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if event.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if event.path.as_ref().map(|p| p.as_str()) != Some(path.as_str()) {
                return false;
            }
        }

        if let Some(namespace) = &self.path_namespace {
            match &event.path {
                Some(path) if path.starts_with_namespace(namespace) => {}
                _ => return false,
            }
        }

        if let Some(destination) = &self.destination {
            if event.destination.as_deref() != Some(destination.as_str()) {
                return false;
            }
        }

        true
    }

    /// The canonical match expression for this condition.
    pub fn expr(&self) -> String {
        let mut parts = Vec::new();

        if let Some(message_type) = self.message_type {
            parts.push(format!("type={}", escape_match(message_type.match_name())));
        }

        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ];

        for (key, value) in fields {
            if let Some(value) = value {
                parts.push(format!("{key}={}", escape_match(value)));
            }
        }

        parts.join(",")
    }
}

struct EmitState {
    conds: Vec<Condition>,
    oflow: bool,
    done: bool,
}

/// The connection-facing half of a subscriber queue.
pub(crate) struct QueueCore {
    pub(crate) id: u64,
    tx: mpsc::Sender<QueueItem>,
    emit: Mutex<EmitState>,
}

impl QueueCore {
    pub(crate) fn new(id: u64, qsize: usize) -> (Arc<QueueCore>, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(qsize.max(1));

        let core = Arc::new(QueueCore {
            id,
            tx,
            emit: Mutex::new(EmitState {
                conds: Vec::new(),
                oflow: false,
                done: false,
            }),
        });

        (core, rx)
    }

    pub(crate) fn push_condition(&self, cond: Condition) {
        let mut st = self.emit.lock().expect("emit state poisoned");
        st.conds.push(cond);
    }

    /// Offer an event to the queue, returning whether any condition
    /// matched it.
    ///
    /// A matching event is enqueued when capacity permits; on a full queue
    /// it is dropped and the overflow flag raised, to be attached to the
    /// next successful delivery exactly once. A drop for backpressure still
    /// counts as matched.
    pub(crate) fn emit(&self, event: &Arc<BusEvent>) -> bool {
        let mut st = self.emit.lock().expect("emit state poisoned");

        if st.done {
            return false;
        }

        if !st.conds.iter().any(|c| c.test(event)) {
            return false;
        }

        let state = if st.oflow {
            QueueState::Oflow
        } else {
            QueueState::Normal
        };

        match self.tx.try_send((Some(event.clone()), state)) {
            Ok(()) => {
                if st.oflow {
                    tracing::debug!(id = self.id, "queue leaves overflow state");
                }

                st.oflow = false;
            }
            Err(TrySendError::Full(..)) => {
                if !st.oflow {
                    tracing::debug!(id = self.id, "queue enters overflow state");
                }

                st.oflow = true;
            }
            Err(TrySendError::Closed(..)) => {}
        }

        true
    }

    /// Deliver the DONE sentinel, waiting for capacity if the queue is
    /// full. Idempotent.
    pub(crate) async fn deliver_done(&self) {
        {
            let mut st = self.emit.lock().expect("emit state poisoned");

            if st.done {
                return;
            }

            st.done = true;
        }

        let _ = self.tx.send((None, QueueState::Done)).await;
    }

    fn conditions(&self) -> Vec<Condition> {
        self.emit.lock().expect("emit state poisoned").conds.clone()
    }
}

/// A subscriber queue of received bus events.
///
/// Created through [`Connection::new_queue`]. Conditions added with
/// [`add`] are registered with the daemon; events matching any condition
/// are delivered in wire order, each carrying a [`QueueState`].
///
/// [`add`]: SignalQueue::add
pub struct SignalQueue {
    conn: Connection,
    core: Arc<QueueCore>,
    rx: mpsc::Receiver<QueueItem>,
    throw_done: bool,
    drained: bool,
}

impl SignalQueue {
    pub(crate) fn new(conn: Connection, id: u64, qsize: usize) -> (Self, Arc<QueueCore>) {
        let (core, rx) = QueueCore::new(id, qsize);

        (
            Self {
                conn,
                core: core.clone(),
                rx,
                throw_done: true,
                drained: false,
            },
            core,
        )
    }

    /// Configure whether a DONE delivery turns into a
    /// `ConnectionClosed` error from [`recv`] instead of a `(None, DONE)`
    /// tuple.
    ///
    /// [`recv`]: SignalQueue::recv
    pub fn set_throw_done(&mut self, throw_done: bool) {
        self.throw_done = throw_done;
    }

    /// Add a matching condition, registering it with the daemon.
    ///
    /// The condition starts matching before the daemon registration
    /// completes, so signals racing the `AddMatch` are not lost.
    pub async fn add(&self, cond: Condition) -> Result<()> {
        cond.check()?;

        if self.core.emit.lock().expect("emit state poisoned").done {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }

        self.core.push_condition(cond.clone());

        if let Err(error) = self.conn.add_match(self.core.id, &cond.expr()).await {
            let mut st = self.core.emit.lock().expect("emit state poisoned");

            if let Some(at) = st.conds.iter().position(|c| c == &cond) {
                st.conds.remove(at);
            }

            return Err(error);
        }

        Ok(())
    }

    /// Remove a condition previously added with [`add`], unregistering it
    /// from the daemon when it was the last owner.
    ///
    /// [`add`]: SignalQueue::add
    pub async fn remove(&self, cond: &Condition) -> Result<()> {
        {
            let mut st = self.core.emit.lock().expect("emit state poisoned");

            let Some(at) = st.conds.iter().position(|c| c == cond) else {
                return Err(Error::new(ErrorKind::UnknownCondition));
            };

            st.conds.remove(at);
        }

        self.conn.remove_match(self.core.id, &cond.expr()).await
    }

    /// Receive the next event tuple.
    ///
    /// After close, returns `(None, DONE)` or raises `ConnectionClosed` if
    /// `throw_done` is set (the default).
    pub async fn recv(&mut self) -> Result<QueueItem> {
        if self.drained {
            return self.done_item();
        }

        let Some((event, state)) = self.rx.recv().await else {
            return self.done_item();
        };

        if state == QueueState::Done {
            self.drained = true;
            return self.done_item();
        }

        Ok((event, state))
    }

    /// Non-blocking variant of [`recv`], returning `None` when nothing is
    /// queued.
    ///
    /// [`recv`]: SignalQueue::recv
    pub fn poll(&mut self) -> Result<Option<QueueItem>> {
        if self.drained {
            return self.done_item().map(Some);
        }

        match self.rx.try_recv() {
            Ok((event, state)) => {
                if state == QueueState::Done {
                    self.drained = true;
                    return self.done_item().map(Some);
                }

                Ok(Some((event, state)))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => self.done_item().map(Some),
        }
    }

    fn done_item(&self) -> Result<QueueItem> {
        if self.throw_done {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }

        Ok((None, QueueState::Done))
    }

    /// Stop receiving: unregister all daemon-side matches this queue owns,
    /// then deliver the DONE sentinel, waiting if the queue is full.
    pub async fn close(&mut self) {
        for cond in self.core.conditions() {
            if let Err(error) = self.conn.remove_match(self.core.id, &cond.expr()).await {
                tracing::debug!("error while removing match: {error}");
            }
        }

        self.conn.remove_queue(self.core.id);
        self.core.deliver_done().await;
    }
}

#[cfg(test)]
mod tests;
