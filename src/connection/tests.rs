use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::frame::{self, Head};
use crate::proto::PREFIX_LENGTH;
use crate::signal::QueueState;
use crate::{daemon, Condition, Connection, ExportObject, Message, ObjectPath, Value};

const FOO_PATH: &ObjectPath = ObjectPath::new_const("/foo/bar");

/// Log of calls received by the fake daemon.
pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

/// Export a minimal `org.freedesktop.DBus` implementation on a peer
/// connection, so that a plain [`Connection`] on the other end of a socket
/// pair can run its daemon-facing paths.
pub(crate) fn export_fake_daemon(conn: &Connection, log: CallLog) {
    let hello_log = log.clone();
    let add_log = log.clone();
    let remove_log = log;

    let object = ExportObject::new()
        .method(daemon::INTERFACE, "Hello", "", "s", move |_| {
            hello_log.lock().unwrap().push("Hello".to_owned());
            Ok(vec![Value::from(":1.0")])
        })
        .unwrap()
        .method(daemon::INTERFACE, "AddMatch", "s", "", move |args| {
            let expr = args[0].as_str().unwrap_or_default();
            add_log.lock().unwrap().push(format!("AddMatch {expr}"));
            Ok(vec![])
        })
        .unwrap()
        .method(daemon::INTERFACE, "RemoveMatch", "s", "", move |args| {
            let expr = args[0].as_str().unwrap_or_default();
            remove_log.lock().unwrap().push(format!("RemoveMatch {expr}"));
            Ok(vec![])
        })
        .unwrap()
        .method(daemon::INTERFACE, "ListNames", "", "as", |_| {
            Ok(vec![Value::Array(vec![
                Value::from("org.freedesktop.DBus"),
                Value::from(":1.0"),
            ])])
        })
        .unwrap();

    conn.attach(daemon::PATH, object).unwrap();
}

/// A connected pair: a client which has performed `Hello` against the fake
/// daemon peer.
pub(crate) async fn client_and_daemon() -> (Connection, Connection, CallLog) {
    let (a, b) = UnixStream::pair().unwrap();

    let log = CallLog::default();
    let peer = Connection::from_stream(b);
    export_fake_daemon(&peer, log.clone());

    let client = Connection::from_stream(a);
    client.setup().await.unwrap();

    (client, peer, log)
}

async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition not reached in time");
}

#[tokio::test]
async fn hello_records_unique_name() {
    let (client, peer, log) = client_and_daemon().await;

    assert_eq!(client.name().as_deref(), Some(":1.0"));
    assert_eq!(*log.lock().unwrap(), ["Hello"]);

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn list_names_includes_daemon() {
    let (client, peer, _) = client_and_daemon().await;

    let names = client.daemon().list_names().await.unwrap();
    assert!(names.iter().any(|n| n == "org.freedesktop.DBus"));

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn peer_echo() {
    let (client, peer, _) = client_and_daemon().await;

    let object = ExportObject::new()
        .method("foo.bar", "Echo", "s", "s", |args| {
            let text = args[0].as_str().unwrap_or_default();
            Ok(vec![Value::from(format!("{text} world"))])
        })
        .unwrap();

    client.attach(FOO_PATH, object).unwrap();

    let m = Message::method_call(FOO_PATH, "Echo")
        .with_interface("foo.bar")
        .with_body("s", vec![Value::from("hello")])
        .unwrap();

    let reply = peer.call(m).await.unwrap().await.unwrap();
    assert_eq!(reply.body(), [Value::from("hello world")]);
    assert_eq!(reply.signature().as_str(), "s");

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn async_method_reply() {
    let (client, peer, _) = client_and_daemon().await;

    let object = ExportObject::new()
        .async_method("foo.bar", "Sleepy", "u", "u", |args| async move {
            let n = args[0].as_u32().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec![Value::UInt32(n + 1)])
        })
        .unwrap();

    client.attach(FOO_PATH, object).unwrap();

    let m = Message::method_call(FOO_PATH, "Sleepy")
        .with_interface("foo.bar")
        .with_body("u", vec![Value::UInt32(9)])
        .unwrap();

    let reply = peer.call(m).await.unwrap().await.unwrap();
    assert_eq!(reply.body(), [Value::UInt32(10)]);

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn unknown_object_and_method() {
    let (client, peer, _) = client_and_daemon().await;

    let object = ExportObject::new()
        .method("foo.bar", "Echo", "s", "s", |args| Ok(args))
        .unwrap();

    client.attach(FOO_PATH, object).unwrap();

    let m = Message::method_call(ObjectPath::new_const("/nothing"), "Echo")
        .with_interface("foo.bar");
    let error = peer.call(m).await.unwrap().await.unwrap_err();
    assert_eq!(error.remote_name(), Some(daemon::error_name::UNKNOWN_OBJECT));

    let m = Message::method_call(FOO_PATH, "Nope").with_interface("foo.bar");
    let error = peer.call(m).await.unwrap().await.unwrap_err();
    assert_eq!(error.remote_name(), Some(daemon::error_name::UNKNOWN_METHOD));

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn introspection_over_the_wire() {
    let (client, peer, _) = client_and_daemon().await;

    let object = ExportObject::new()
        .method("foo.bar", "Echo", "s", "s", |args| Ok(args))
        .unwrap();

    client.attach(FOO_PATH, object).unwrap();

    let m = Message::method_call(FOO_PATH, "Introspect")
        .with_interface(daemon::INTROSPECTABLE);

    let reply = peer.call(m).await.unwrap().await.unwrap();
    let xml = reply.body()[0].as_str().unwrap();
    assert!(xml.contains("<interface name=\"foo.bar\">"));

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn signal_delivery() {
    let (client, peer, _) = client_and_daemon().await;

    let mut queue = client.new_queue(4).unwrap();
    queue
        .add(Condition::new().interface("foo.bar").member("Testing"))
        .await
        .unwrap();

    let m = Message::signal(FOO_PATH, "Testing")
        .with_interface("foo.bar")
        .with_body("s", vec![Value::from("one")])
        .unwrap();

    peer.send(m).await.unwrap();

    let (event, state) = queue.recv().await.unwrap();
    let event = event.unwrap();

    assert_eq!(state, QueueState::Normal);
    assert_eq!(event.member(), Some("Testing"));
    assert_eq!(event.body(), [Value::from("one")]);

    queue.close().await;
    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn match_registration_is_deduplicated() {
    let (client, peer, log) = client_and_daemon().await;

    let cond = || Condition::new().interface("foo.bar").member("Testing");
    let expr = "interface='foo.bar',member='Testing'";

    let mut q1 = client.new_queue(4).unwrap();
    q1.add(cond()).await.unwrap();

    let mut q2 = client.new_queue(4).unwrap();
    q2.add(cond()).await.unwrap();

    let adds = |log: &CallLog| {
        log.lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("AddMatch"))
            .count()
    };
    let removes = |log: &CallLog| {
        log.lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("RemoveMatch"))
            .count()
    };

    // One AddMatch for two subscribers of the same expression.
    assert_eq!(adds(&log), 1);
    assert!(log.lock().unwrap().contains(&format!("AddMatch {expr}")));

    q1.close().await;
    assert_eq!(removes(&log), 0);

    q2.close().await;
    assert_eq!(removes(&log), 1);

    client.close().await;
    peer.close().await;
}

#[tokio::test]
async fn pending_replies_fail_on_close() {
    let (client, peer, _) = client_and_daemon().await;

    // A method which never resolves keeps the reply slot outstanding.
    let object = ExportObject::new()
        .async_method("foo.bar", "Stall", "", "", |_| async {
            std::future::pending::<()>().await;
            Ok(vec![])
        })
        .unwrap();

    client.attach(FOO_PATH, object).unwrap();

    let m = Message::method_call(FOO_PATH, "Stall").with_interface("foo.bar");
    let pending = peer.call(m).await.unwrap();

    peer.close().await;

    let error = pending.await.unwrap_err();
    assert!(error.is_no_reply());

    client.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, peer, _) = client_and_daemon().await;

    client.close().await;
    client.close().await;

    assert!(!client.is_running());
    assert!(client.call(Message::method_call(FOO_PATH, "X")).await.is_err());
    assert!(client.new_queue(4).is_err());

    peer.close().await;
}

#[tokio::test]
async fn remote_close_resolves_lost() {
    let (client, peer, _) = client_and_daemon().await;

    let mut queue = client.new_queue(4).unwrap();
    queue.set_throw_done(false);
    queue
        .add(Condition::new().interface("foo.bar"))
        .await
        .unwrap();

    // Closing the peer drops its writer, which the client observes as EOF.
    peer.close().await;

    client.lost().await;
    wait_for(|| !client.is_running()).await;

    // Queues are delivered the DONE sentinel.
    let (event, state) = queue.recv().await.unwrap();
    assert!(event.is_none());
    assert_eq!(state, QueueState::Done);

    client.close().await;
}

#[tokio::test]
async fn name_tracking_from_daemon_signals() {
    let (client, peer, _) = client_and_daemon().await;

    let m = Message::signal(daemon::PATH, "NameAcquired")
        .with_interface(daemon::INTERFACE)
        .with_sender(daemon::DESTINATION)
        .with_body("s", vec![Value::from("foo.bar")])
        .unwrap();

    peer.send(m).await.unwrap();

    wait_for(|| client.names().contains(&"foo.bar".to_owned())).await;

    let m = Message::signal(daemon::PATH, "NameLost")
        .with_interface(daemon::INTERFACE)
        .with_sender(daemon::DESTINATION)
        .with_body("s", vec![Value::from("foo.bar")])
        .unwrap();

    peer.send(m).await.unwrap();

    wait_for(|| !client.names().contains(&"foo.bar".to_owned())).await;

    client.close().await;
    peer.close().await;
}

/// Drive the raw wire against a [`Connection`]: serials must be distinct
/// and increasing, and replies resolve their own callers even when they
/// arrive out of order.
#[tokio::test]
async fn serials_and_out_of_order_replies() {
    let (a, mut raw) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a);

    let call = |member: &str| {
        Message::method_call(FOO_PATH, member)
            .with_interface("foo.bar")
            .with_destination(":1.9")
    };

    let first = client.call(call("First")).await.unwrap();
    let second = client.call(call("Second")).await.unwrap();

    async fn read_event(raw: &mut UnixStream) -> crate::BusEvent {
        let mut prefix = [0u8; PREFIX_LENGTH];
        raw.read_exact(&mut prefix).await.unwrap();
        let head = Head::parse(&prefix).unwrap();

        let mut bytes = vec![0u8; PREFIX_LENGTH + head.remaining()];
        bytes[..PREFIX_LENGTH].copy_from_slice(&prefix);
        raw.read_exact(&mut bytes[PREFIX_LENGTH..]).await.unwrap();

        frame::deserialize(&head, &bytes).unwrap()
    }

    let e1 = read_event(&mut raw).await;
    let e2 = read_event(&mut raw).await;

    assert_eq!(e1.member(), Some("First"));
    assert_eq!(e2.member(), Some("Second"));
    assert!(e2.serial() > e1.serial());

    // Reply to the second call first.
    for event in [&e2, &e1] {
        let member = event.member().unwrap().to_lowercase();

        let reply = event
            .method_return()
            .with_body("s", vec![Value::from(member.as_str())])
            .unwrap();

        let bytes = frame::serialize(&reply, event.serial(), crate::proto::Endianness::NATIVE)
            .unwrap();
        raw.write_all(&bytes).await.unwrap();
    }

    assert_eq!(first.await.unwrap().body(), [Value::from("first")]);
    assert_eq!(second.await.unwrap().body(), [Value::from("second")]);

    client.close().await;
}
