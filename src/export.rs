//! Object export and inbound method dispatch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::daemon::{error_name, INTROSPECTABLE};
use crate::error::ErrorKind;
use crate::message::BusEvent;
use crate::{Error, ObjectPath, Result, SignatureBuf, Value};

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// A boxed future produced by an asynchronous exported method.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'static>>;

/// The result of invoking an exported method handler.
///
/// A ready result is packaged into a METHOD_RETURN (or ERROR) immediately; a
/// future is awaited first and its outcome packaged the same way.
pub enum MethodReply {
    /// The handler completed synchronously.
    Ready(Result<Vec<Value>>),
    /// The handler returned a future to await.
    Future(MethodFuture),
}

pub(crate) type Handler = Arc<dyn Fn(Vec<Value>) -> MethodReply + Send + Sync>;

struct ExportMethod {
    interface: String,
    member: String,
    args: SignatureBuf,
    result: SignatureBuf,
    handler: Handler,
}

struct ExportSignal {
    interface: String,
    member: String,
    args: SignatureBuf,
}

/// A set of methods and signals exported at one object path.
///
/// # Examples
///
/// ```
/// use busmux::{ExportObject, Value};
///
/// let object = ExportObject::new().method("foo.bar", "Echo", "s", "s", |args| {
///     let Some(text) = args[0].as_str() else {
///         return Ok(vec![Value::from("")]);
///     };
///
///     Ok(vec![Value::from(format!("{text} world"))])
/// })?;
/// # Ok::<_, busmux::Error>(())
/// ```
pub struct ExportObject {
    methods: Vec<ExportMethod>,
    signals: Vec<ExportSignal>,
}

impl ExportObject {
    /// Construct an empty object.
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
            signals: Vec::new(),
        }
    }

    fn with_method(
        mut self,
        interface: &str,
        member: &str,
        args: &str,
        result: &str,
        handler: Handler,
    ) -> Result<Self> {
        self.methods.push(ExportMethod {
            interface: interface.to_owned(),
            member: member.to_owned(),
            args: SignatureBuf::from_str(args)?,
            result: SignatureBuf::from_str(result)?,
            handler,
        });

        Ok(self)
    }

    /// Export a synchronous method.
    ///
    /// `args` and `result` are the wire-level input and return signatures;
    /// the handler receives one positional argument per element of `args`
    /// and returns one value per element of `result`.
    pub fn method<F>(
        self,
        interface: &str,
        member: &str,
        args: &str,
        result: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.with_method(
            interface,
            member,
            args,
            result,
            Arc::new(move |a| MethodReply::Ready(handler(a))),
        )
    }

    /// Export an asynchronous method. The reply is sent when the returned
    /// future resolves.
    pub fn async_method<F, Fut>(
        self,
        interface: &str,
        member: &str,
        args: &str,
        result: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        self.with_method(
            interface,
            member,
            args,
            result,
            Arc::new(move |a| MethodReply::Future(Box::pin(handler(a)))),
        )
    }

    /// Declare a signal in the object's introspection document.
    pub fn signal(mut self, interface: &str, member: &str, args: &str) -> Result<Self> {
        self.signals.push(ExportSignal {
            interface: interface.to_owned(),
            member: member.to_owned(),
            args: SignatureBuf::from_str(args)?,
        });

        Ok(self)
    }
}

impl Default for ExportObject {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExportObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportObject")
            .field("methods", &self.methods.len())
            .field("signals", &self.signals.len())
            .finish()
    }
}

/// The outcome of dispatching an inbound method call.
pub(crate) enum Dispatch {
    /// Invoke the handler with the given arguments; package the outcome
    /// under the result signature.
    Invoke {
        handler: Handler,
        args: Vec<Value>,
        result: SignatureBuf,
    },
    /// Answer with the node's cached introspection document.
    Introspect(String),
    /// Answer with an error.
    Error {
        name: &'static str,
        message: String,
    },
}

struct Node {
    children: HashMap<String, usize>,
    object: Option<ExportObject>,
    xml: Option<String>,
}

impl Node {
    fn empty() -> Self {
        Self {
            children: HashMap::new(),
            object: None,
            xml: None,
        }
    }
}

/// The export table: a trie keyed by path segments, arena-indexed so nodes
/// never form reference cycles.
pub(crate) struct ObjectTree {
    nodes: Vec<Node>,
}

impl ObjectTree {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node::empty()],
        }
    }

    fn find(&self, path: &ObjectPath) -> Option<usize> {
        let mut at = 0;

        for segment in path.segments() {
            at = *self.nodes[at].children.get(segment)?;
        }

        Some(at)
    }

    fn ensure(&mut self, path: &ObjectPath) -> usize {
        let mut at = 0;

        for segment in path.segments() {
            if let Some(&child) = self.nodes[at].children.get(segment) {
                at = child;
                continue;
            }

            let child = self.nodes.len();
            self.nodes.push(Node::empty());
            self.nodes[at].children.insert(segment.to_owned(), child);
            at = child;
        }

        at
    }

    /// Install an object at the given path. Fails if the path is occupied.
    pub(crate) fn attach(&mut self, path: &ObjectPath, object: ExportObject) -> Result<()> {
        let at = self.ensure(path);

        if self.nodes[at].object.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExported(
                path.as_str().into(),
            )));
        }

        self.nodes[at].object = Some(object);
        self.refresh_xml();
        Ok(())
    }

    /// Clear the object at the given path. Empty nodes are kept for subtree
    /// navigation.
    pub(crate) fn detach(&mut self, path: &ObjectPath) -> Result<()> {
        let Some(at) = self.find(path) else {
            return Err(Error::new(ErrorKind::NotExported(path.as_str().into())));
        };

        if self.nodes[at].object.take().is_none() {
            return Err(Error::new(ErrorKind::NotExported(path.as_str().into())));
        }

        self.nodes[at].xml = None;
        self.refresh_xml();
        Ok(())
    }

    /// Recompute the cached introspection documents. Attach and detach can
    /// change the child references of every node on the path, so all
    /// exported nodes are re-rendered.
    fn refresh_xml(&mut self) {
        let rendered = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.object.is_some())
            .map(|(at, node)| (at, self.render(node)))
            .collect::<Vec<_>>();

        for (at, xml) in rendered {
            self.nodes[at].xml = Some(xml);
        }
    }

    fn render(&self, node: &Node) -> String {
        let object = node.object.as_ref().expect("render requires an object");

        let mut out = String::from(DOCTYPE);
        out.push_str("<node>\n");

        out.push_str(&format!(" <interface name=\"{INTROSPECTABLE}\">\n"));
        out.push_str("  <method name=\"Introspect\">\n");
        out.push_str("   <arg direction=\"out\" type=\"s\"/>\n");
        out.push_str("  </method>\n");
        out.push_str(" </interface>\n");

        let mut interfaces = Vec::new();

        for m in &object.methods {
            if !interfaces.contains(&m.interface.as_str()) {
                interfaces.push(m.interface.as_str());
            }
        }

        for s in &object.signals {
            if !interfaces.contains(&s.interface.as_str()) {
                interfaces.push(s.interface.as_str());
            }
        }

        for interface in interfaces {
            out.push_str(&format!(" <interface name=\"{interface}\">\n"));

            for m in object.methods.iter().filter(|m| m.interface == interface) {
                out.push_str(&format!("  <method name=\"{}\">\n", m.member));

                for arg in m.args.iter() {
                    out.push_str(&format!("   <arg direction=\"in\" type=\"{arg}\"/>\n"));
                }

                for arg in m.result.iter() {
                    out.push_str(&format!("   <arg direction=\"out\" type=\"{arg}\"/>\n"));
                }

                out.push_str("  </method>\n");
            }

            for s in object.signals.iter().filter(|s| s.interface == interface) {
                out.push_str(&format!("  <signal name=\"{}\">\n", s.member));

                for arg in s.args.iter() {
                    out.push_str(&format!("   <arg type=\"{arg}\"/>\n"));
                }

                out.push_str("  </signal>\n");
            }

            out.push_str(" </interface>\n");
        }

        let mut children = node.children.keys().collect::<Vec<_>>();
        children.sort();

        for child in children {
            out.push_str(&format!(" <node name=\"{child}\"/>\n"));
        }

        out.push_str("</node>\n");
        out
    }

    /// Dispatch an inbound method call event.
    pub(crate) fn handle(&self, event: &BusEvent) -> Dispatch {
        let unknown_object = |path: &str| Dispatch::Error {
            name: error_name::UNKNOWN_OBJECT,
            message: format!("no object at {path}"),
        };

        let Some(path) = event.path() else {
            return unknown_object("<missing>");
        };

        let Some(at) = self.find(path) else {
            return unknown_object(path.as_str());
        };

        let node = &self.nodes[at];

        let Some(object) = &node.object else {
            return unknown_object(path.as_str());
        };

        let member = event.member().unwrap_or_default();

        if member == "Introspect" && matches!(event.interface(), None | Some(INTROSPECTABLE)) {
            return Dispatch::Introspect(
                node.xml.clone().expect("exported nodes carry a document"),
            );
        }

        let method = object.methods.iter().find(|m| {
            m.member == member && event.interface().map_or(true, |i| i == m.interface)
        });

        let Some(method) = method else {
            return Dispatch::Error {
                name: error_name::UNKNOWN_METHOD,
                message: format!(
                    "no method {}.{member} at {path}",
                    event.interface().unwrap_or("<any>")
                ),
            };
        };

        if *event.signature() != *method.args {
            return Dispatch::Error {
                name: error_name::INVALID_ARGS,
                message: format!(
                    "call signature {:?} does not match {:?}",
                    event.signature(),
                    method.args
                ),
            };
        }

        Dispatch::Invoke {
            handler: method.handler.clone(),
            args: event.body().to_vec(),
            result: method.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::message::BusEvent;
    use crate::proto::{Flags, MessageType};
    use crate::{ObjectPath, ObjectPathBuf, SignatureBuf, Value};

    use super::{Dispatch, ExportObject, MethodReply, ObjectTree};

    fn call(path: &str, interface: Option<&str>, member: &str, sig: &str, body: Vec<Value>) -> BusEvent {
        BusEvent {
            message_type: MessageType::METHOD_CALL,
            flags: Flags::EMPTY,
            serial: NonZeroU32::new(7).unwrap(),
            path: Some(ObjectPathBuf::new(path).unwrap()),
            interface: interface.map(str::to_owned),
            member: Some(member.to_owned()),
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: Some(":1.9".to_owned()),
            signature: SignatureBuf::from_str(sig).unwrap(),
            body,
        }
    }

    fn echo_object() -> ExportObject {
        ExportObject::new()
            .method("foo.bar", "Echo", "s", "s", |args| {
                let text = args[0].as_str().unwrap_or_default();
                Ok(vec![Value::from(format!("{text} world"))])
            })
            .unwrap()
            .signal("foo.bar", "Changed", "i")
            .unwrap()
    }

    fn invoke(dispatch: Dispatch) -> crate::Result<Vec<Value>> {
        match dispatch {
            Dispatch::Invoke { handler, args, .. } => match handler(args) {
                MethodReply::Ready(result) => result,
                MethodReply::Future(..) => panic!("expected a ready reply"),
            },
            Dispatch::Introspect(..) => panic!("unexpected introspection"),
            Dispatch::Error { name, message } => {
                panic!("unexpected dispatch error {name}: {message}")
            }
        }
    }

    #[test]
    fn attach_and_dispatch() {
        let mut tree = ObjectTree::new();
        let path = ObjectPath::new_const("/foo/bar");

        tree.attach(path, echo_object()).unwrap();

        let result = invoke(tree.handle(&call(
            "/foo/bar",
            Some("foo.bar"),
            "Echo",
            "s",
            vec![Value::from("hello")],
        )))
        .unwrap();

        assert_eq!(result, [Value::from("hello world")]);

        // Interface-less calls match by member alone.
        let result = invoke(tree.handle(&call(
            "/foo/bar",
            None,
            "Echo",
            "s",
            vec![Value::from("big")],
        )))
        .unwrap();

        assert_eq!(result, [Value::from("big world")]);
    }

    #[test]
    fn occupied_path_is_rejected() {
        let mut tree = ObjectTree::new();
        let path = ObjectPath::new_const("/foo");

        tree.attach(path, echo_object()).unwrap();
        assert!(tree.attach(path, echo_object()).is_err());

        tree.detach(path).unwrap();
        assert!(tree.detach(path).is_err());
        tree.attach(path, echo_object()).unwrap();
    }

    #[test]
    fn unknown_object_and_method() {
        let mut tree = ObjectTree::new();
        tree.attach(ObjectPath::new_const("/foo"), echo_object()).unwrap();

        let dispatch = tree.handle(&call("/nope", Some("foo.bar"), "Echo", "s", vec![]));
        assert!(matches!(
            dispatch,
            Dispatch::Error { name, .. } if name.ends_with("UnknownObject")
        ));

        let dispatch = tree.handle(&call("/foo", Some("foo.bar"), "Nope", "", vec![]));
        assert!(matches!(
            dispatch,
            Dispatch::Error { name, .. } if name.ends_with("UnknownMethod")
        ));

        // Mismatched interface also fails the lookup.
        let dispatch = tree.handle(&call("/foo", Some("other.iface"), "Echo", "s", vec![]));
        assert!(matches!(
            dispatch,
            Dispatch::Error { name, .. } if name.ends_with("UnknownMethod")
        ));
    }

    #[test]
    fn mismatched_arguments() {
        let mut tree = ObjectTree::new();
        tree.attach(ObjectPath::new_const("/foo"), echo_object()).unwrap();

        let dispatch = tree.handle(&call(
            "/foo",
            Some("foo.bar"),
            "Echo",
            "u",
            vec![Value::UInt32(2)],
        ));

        assert!(matches!(
            dispatch,
            Dispatch::Error { name, .. } if name.ends_with("InvalidArgs")
        ));
    }

    #[test]
    fn introspection_document() {
        let mut tree = ObjectTree::new();
        tree.attach(ObjectPath::new_const("/foo"), echo_object()).unwrap();
        tree.attach(ObjectPath::new_const("/foo/child"), echo_object())
            .unwrap();

        let dispatch = tree.handle(&call(
            "/foo",
            Some("org.freedesktop.DBus.Introspectable"),
            "Introspect",
            "",
            vec![],
        ));

        let Dispatch::Introspect(xml) = dispatch else {
            panic!("expected introspection");
        };

        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Introspectable\">"));
        assert!(xml.contains("<interface name=\"foo.bar\">"));
        assert!(xml.contains("<method name=\"Echo\">"));
        assert!(xml.contains("<arg direction=\"in\" type=\"s\"/>"));
        assert!(xml.contains("<signal name=\"Changed\">"));
        assert!(xml.contains("<node name=\"child\"/>"));
    }
}
