use std::num::NonZeroU32;
use std::sync::Arc;

use crate::message::BusEvent;
use crate::proto::{Flags, MessageType};
use crate::{ObjectPathBuf, SignatureBuf};

use super::{escape_match, Condition, QueueCore, QueueState};

fn event(
    path: &str,
    interface: &str,
    member: &str,
    destination: Option<&str>,
    sender: &str,
) -> Arc<BusEvent> {
    Arc::new(BusEvent {
        message_type: MessageType::SIGNAL,
        flags: Flags::EMPTY,
        serial: NonZeroU32::new(1).unwrap(),
        path: Some(ObjectPathBuf::new(path).unwrap()),
        interface: Some(interface.to_owned()),
        member: Some(member.to_owned()),
        error_name: None,
        reply_serial: None,
        destination: destination.map(str::to_owned),
        sender: Some(sender.to_owned()),
        signature: SignatureBuf::empty(),
        body: Vec::new(),
    })
}

fn evt1() -> Arc<BusEvent> {
    event("/path", "i.face", "member", Some("dest"), ":1.1")
}

fn evt2() -> Arc<BusEvent> {
    event("/path", "i.face", "member", None, ":1.1")
}

fn evt3() -> Arc<BusEvent> {
    event("/path/more", "i.face2", "other", Some("destination"), ":1.2")
}

#[test]
fn test_wildcard() {
    let cond = Condition::new();
    assert!(cond.test(&evt1()));
    assert!(cond.test(&evt2()));
    assert!(cond.test(&evt3()));
}

#[test]
fn test_path() {
    let cond = Condition::new().path("/path");
    assert!(cond.test(&evt1()));
    assert!(cond.test(&evt2()));
    assert!(!cond.test(&evt3()));
}

#[test]
fn test_path_namespace() {
    let cond = Condition::new().path("/path/*");
    assert!(cond.test(&evt1()));
    assert!(cond.test(&evt3()));
    assert!(!cond.test(&event("/pathology", "i", "m", None, ":1.1")));
}

#[test]
fn test_iface() {
    let cond = Condition::new().interface("i.face2");
    assert!(!cond.test(&evt1()));
    assert!(!cond.test(&evt2()));
    assert!(cond.test(&evt3()));
}

#[test]
fn test_member() {
    let cond = Condition::new().member("member");
    assert!(cond.test(&evt1()));
    assert!(cond.test(&evt2()));
    assert!(!cond.test(&evt3()));
}

#[test]
fn test_dest() {
    let cond = Condition::new().destination("dest");
    assert!(cond.test(&evt1()));
    assert!(!cond.test(&evt2()));
    assert!(!cond.test(&evt3()));
}

#[test]
fn test_sender() {
    let cond = Condition::new().sender(":1.1");
    assert!(cond.test(&evt1()));
    assert!(cond.test(&evt2()));
    assert!(!cond.test(&evt3()));
}

#[test]
fn test_type() {
    let cond = Condition::new().signals();
    assert!(cond.test(&evt1()));
    assert_eq!(cond.expr(), "type='signal'");
}

#[test]
fn test_expr() {
    let cond = Condition::new().interface("foo.bar").member("Testing");
    assert_eq!(cond.expr(), "interface='foo.bar',member='Testing'");

    let cond = Condition::new()
        .signals()
        .sender(":1.5")
        .path("/a/b")
        .destination("d.e");
    assert_eq!(
        cond.expr(),
        "type='signal',sender=':1.5',path='/a/b',destination='d.e'"
    );
}

#[test]
fn test_well_known_sender_rejected() {
    assert!(Condition::new().sender(":1.5").check().is_ok());
    assert!(Condition::new()
        .sender("org.freedesktop.DBus")
        .check()
        .is_ok());
    assert!(Condition::new().sender("foo.bar").check().is_err());
}

#[test]
fn test_escape() {
    assert_eq!(escape_match("simple"), "'simple'");
    assert_eq!(escape_match(""), "''");
    assert_eq!(escape_match("don't"), "'don'\\''t'");
    assert_eq!(escape_match("'"), "\\'");
    assert_eq!(escape_match("a'b'c"), "'a'\\''b'\\''c'");
}

#[tokio::test]
async fn test_emit_and_oflow() {
    let (core, mut rx) = QueueCore::new(1, 2);
    core.push_condition(Condition::new());

    // Three matching emits into a queue of two: all match, the third is
    // dropped for backpressure.
    assert!(core.emit(&evt1()));
    assert!(core.emit(&evt1()));
    assert!(core.emit(&evt1()));

    let (_, state) = rx.recv().await.unwrap();
    assert_eq!(state, QueueState::Normal);

    // The next successful enqueue carries the overflow marker exactly once.
    assert!(core.emit(&evt1()));

    let (_, state) = rx.recv().await.unwrap();
    assert_eq!(state, QueueState::Normal);

    let (_, state) = rx.recv().await.unwrap();
    assert_eq!(state, QueueState::Oflow);

    assert!(core.emit(&evt1()));
    let (_, state) = rx.recv().await.unwrap();
    assert_eq!(state, QueueState::Normal);
}

#[tokio::test]
async fn test_no_match_no_enqueue() {
    let (core, mut rx) = QueueCore::new(2, 4);
    core.push_condition(Condition::new().member("other"));

    assert!(!core.emit(&evt1()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_done_sentinel() {
    let (core, mut rx) = QueueCore::new(3, 4);
    core.push_condition(Condition::new());

    assert!(core.emit(&evt1()));

    core.deliver_done().await;
    // A second delivery is a no-op.
    core.deliver_done().await;

    // Events are not accepted after DONE.
    assert!(!core.emit(&evt1()));

    let (event, state) = rx.recv().await.unwrap();
    assert!(event.is_some());
    assert_eq!(state, QueueState::Normal);

    let (event, state) = rx.recv().await.unwrap();
    assert!(event.is_none());
    assert_eq!(state, QueueState::Done);

    assert!(rx.try_recv().is_err());
}
