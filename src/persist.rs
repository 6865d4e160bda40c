//! A connection wrapper which transparently reconnects.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionBuilder, PendingReply, Reply};
use crate::error::ErrorKind;
use crate::{Error, Message, Result};

const INITIAL_RETRY: Duration = Duration::from_millis(100);
const MAX_RETRY: Duration = Duration::from_secs(15);

struct QueuedCall {
    message: Message,
    slot: oneshot::Sender<Result<Reply>>,
}

struct PersistState {
    conn: Option<Connection>,
    queue: Vec<QueuedCall>,
}

struct PersistShared {
    state: StdMutex<PersistState>,
    connected_tx: watch::Sender<bool>,
    closing_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

/// A bus connection which re-creates itself on disconnect, with
/// exponential backoff capped at fifteen seconds.
///
/// While disconnected, method calls are enqueued and reissued in FIFO order
/// on the next successful connection; signals are dropped.
///
/// # Examples
///
/// ```no_run
/// use busmux::{ConnectionBuilder, PersistentConnection};
///
/// # #[tokio::main] async fn main() -> busmux::Result<()> {
/// let bus = PersistentConnection::new(ConnectionBuilder::new().session_bus());
/// bus.wait_connected().await;
/// println!("name: {:?}", bus.name());
/// bus.close().await;
/// # Ok(()) }
/// ```
pub struct PersistentConnection {
    shared: Arc<PersistShared>,
}

impl PersistentConnection {
    /// Start the reconnect worker with the given connection configuration.
    pub fn new(builder: ConnectionBuilder) -> Self {
        let shared = Arc::new(PersistShared {
            state: StdMutex::new(PersistState {
                conn: None,
                queue: Vec::new(),
            }),
            connected_tx: watch::channel(false).0,
            closing_tx: watch::channel(false).0,
            done_tx: watch::channel(false).0,
            worker: StdMutex::new(None),
        });

        let handle = tokio::spawn(worker(shared.clone(), builder));
        *shared.worker.lock().expect("worker poisoned") = Some(handle);

        Self { shared }
    }

    /// Test if a connection is currently established.
    pub fn connected(&self) -> bool {
        self.shared.state.lock().expect("state poisoned").conn.is_some()
    }

    /// Wait until a connection is established.
    pub async fn wait_connected(&self) {
        let mut rx = self.shared.connected_tx.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// The primary bus name, while connected.
    pub fn name(&self) -> Option<String> {
        let st = self.shared.state.lock().expect("state poisoned");
        st.conn.as_ref().and_then(|c| c.name())
    }

    /// The current underlying connection, while connected.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.state.lock().expect("state poisoned").conn.clone()
    }

    /// Issue a method call, queueing it if currently disconnected.
    pub async fn call(&self, message: Message) -> Result<PendingReply> {
        if *self.shared.closing_tx.borrow() {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }

        let conn = {
            let mut st = self.shared.state.lock().expect("state poisoned");

            match st.conn.clone() {
                Some(conn) => conn,
                None => {
                    let (tx, rx) = oneshot::channel();
                    st.queue.push(QueuedCall {
                        message,
                        slot: tx,
                    });
                    return Ok(PendingReply::new(rx));
                }
            }
        };

        conn.call(message).await
    }

    /// Emit a signal. Dropped silently while disconnected.
    pub async fn signal(&self, message: Message) -> Result<()> {
        let conn = self.shared.state.lock().expect("state poisoned").conn.clone();

        match conn {
            Some(conn) => conn.send(message).await,
            None => Ok(()),
        }
    }

    /// Stop reconnecting and close any current connection. Queued calls
    /// fail with a connection-closed error. Idempotent.
    pub async fn close(&self) {
        let was_closing = self.shared.closing_tx.send_replace(true);

        if was_closing {
            let mut done = self.shared.done_tx.subscribe();
            let _ = done.wait_for(|done| *done).await;
            return;
        }

        let worker = self.shared.worker.lock().expect("worker poisoned").take();

        if let Some(handle) = worker {
            let _ = handle.await;
        }

        let (conn, queued) = {
            let mut st = self.shared.state.lock().expect("state poisoned");
            (st.conn.take(), std::mem::take(&mut st.queue))
        };

        if let Some(conn) = conn {
            conn.close().await;
        }

        for call in queued {
            let _ = call.slot.send(Err(Error::new(ErrorKind::ConnectionClosed)));
        }

        self.shared.done_tx.send_replace(true);
    }
}

async fn worker(shared: Arc<PersistShared>, builder: ConnectionBuilder) {
    let mut closing = shared.closing_tx.subscribe();
    let mut retry = INITIAL_RETRY;

    loop {
        if *closing.borrow() {
            break;
        }

        tracing::debug!("connecting");

        match builder.build().await {
            Ok(conn) => {
                retry = INITIAL_RETRY;
                tracing::debug!("connected as {:?}", conn.name());

                let queued = {
                    let mut st = shared.state.lock().expect("state poisoned");
                    st.conn = Some(conn.clone());
                    std::mem::take(&mut st.queue)
                };

                shared.connected_tx.send_replace(true);

                for call in queued {
                    let QueuedCall { message, slot } = call;

                    match conn.call(message).await {
                        Ok(pending) => {
                            tokio::spawn(async move {
                                let _ = slot.send(pending.await);
                            });
                        }
                        Err(error) => {
                            let _ = slot.send(Err(error));
                        }
                    }
                }

                tokio::select! {
                    _ = conn.lost() => {
                        tracing::debug!("disconnected");
                    }
                    _ = closing.wait_for(|closing| *closing) => {}
                }

                conn.close().await;
                shared.state.lock().expect("state poisoned").conn = None;
                shared.connected_tx.send_replace(false);
            }
            Err(error) => {
                tracing::debug!("error while (re)connecting: {error}");
            }
        }

        if *closing.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = closing.wait_for(|closing| *closing) => break,
        }

        retry = (retry * 3 / 2).min(MAX_RETRY);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};

    use crate::connection::tests::{export_fake_daemon, CallLog};
    use crate::{daemon, BusAddress, Connection, ConnectionBuilder, Message, Value};

    use super::PersistentConnection;

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("busmux-{}-{tag}.sock", std::process::id()))
    }

    async fn read_line(stream: &mut UnixStream) -> Vec<u8> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            stream.read_exact(&mut byte).await.unwrap();

            if byte[0] == b'\n' {
                return line;
            }

            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
    }

    /// Speak the server side of the SASL handshake.
    async fn sasl_server(stream: &mut UnixStream) {
        let line = read_line(stream).await;
        assert_eq!(line, b"\0AUTH");
        stream.write_all(b"REJECTED EXTERNAL ANONYMOUS\r\n").await.unwrap();

        let line = read_line(stream).await;
        assert!(line.starts_with(b"AUTH EXTERNAL "));
        stream.write_all(b"OK 1234deadbeef\r\n").await.unwrap();

        let line = read_line(stream).await;
        assert_eq!(line, b"BEGIN");
    }

    /// Accept one connection and serve the fake daemon over it.
    async fn serve_once(listener: &UnixListener, log: CallLog) -> Connection {
        let (mut stream, _) = listener.accept().await.unwrap();
        sasl_server(&mut stream).await;

        let conn = Connection::from_stream(stream);
        export_fake_daemon(&conn, log);
        conn
    }

    #[tokio::test]
    async fn queued_calls_replay_after_connect() {
        let path = socket_path("replay");
        let _ = std::fs::remove_file(&path);

        let builder = ConnectionBuilder::new().addresses(vec![BusAddress::Unix {
            path: path.clone(),
        }]);

        // No listener yet: the first call is queued.
        let bus = PersistentConnection::new(builder);
        assert!(!bus.connected());

        let m = Message::method_call(daemon::PATH, "ListNames")
            .with_interface(daemon::INTERFACE)
            .with_destination(daemon::DESTINATION);

        let pending = bus.call(m).await.unwrap();

        let listener = UnixListener::bind(&path).unwrap();
        let log = CallLog::default();
        let server = serve_once(&listener, log.clone()).await;

        bus.wait_connected().await;
        assert!(bus.name().is_some());

        // The queued call was reissued against the fresh connection.
        let reply = pending.await.unwrap();
        assert_eq!(
            reply.body(),
            [Value::Array(vec![
                Value::from("org.freedesktop.DBus"),
                Value::from(":1.0"),
            ])]
        );

        bus.close().await;
        server.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn close_fails_queued_calls() {
        let path = socket_path("closed");
        let _ = std::fs::remove_file(&path);

        let builder = ConnectionBuilder::new().addresses(vec![BusAddress::Unix {
            path: path.clone(),
        }]);

        let bus = PersistentConnection::new(builder);

        let m = Message::method_call(daemon::PATH, "ListNames")
            .with_interface(daemon::INTERFACE)
            .with_destination(daemon::DESTINATION);

        let pending = bus.call(m).await.unwrap();

        // Signals while disconnected are dropped, not queued.
        let signal = Message::signal(daemon::PATH, "Nothing").with_interface("foo.bar");
        bus.signal(signal).await.unwrap();

        bus.close().await;
        bus.close().await;

        let error = pending.await.unwrap_err();
        assert!(error.is_closed() || error.is_no_reply());

        assert!(bus.call(Message::method_call(daemon::PATH, "X")).await.is_err());
    }
}
