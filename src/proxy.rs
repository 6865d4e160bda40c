//! Introspection-driven proxies for remote objects.

use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::connection::DEFAULT_QUEUE_SIZE;
use crate::daemon::INTROSPECTABLE;
use crate::error::ErrorKind;
use crate::{
    Condition, Connection, Error, Message, ObjectPath, ObjectPathBuf, Reply, Result, Signature,
    SignatureBuf, SignalQueue, Value,
};

/// A callable member discovered through introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMethod {
    name: String,
    args: SignatureBuf,
    result: SignatureBuf,
}

impl ProxyMethod {
    /// The member name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concatenated input signature.
    pub fn args(&self) -> &Signature {
        &self.args
    }

    /// The concatenated return signature.
    pub fn result(&self) -> &Signature {
        &self.result
    }
}

/// A signal declared by the introspected interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySignal {
    name: String,
    args: SignatureBuf,
}

impl ProxySignal {
    /// The signal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concatenated argument signature.
    pub fn args(&self) -> &Signature {
        &self.args
    }
}

/// A dynamic proxy for one (destination, path, interface) triple.
///
/// The proxy is built from the destination's introspection document and
/// validates call arguments against the discovered method signatures.
///
/// # Examples
///
/// ```no_run
/// use busmux::{Connection, Proxy, Value};
///
/// # #[tokio::main] async fn main() -> busmux::Result<()> {
/// let c = Connection::session_bus().await?;
///
/// let daemon = Proxy::new(
///     &c,
///     "org.freedesktop.DBus",
///     busmux::daemon::PATH,
///     "org.freedesktop.DBus",
/// )
/// .await?;
///
/// let reply = daemon.call("GetId", vec![]).await?;
/// println!("bus id: {:?}", reply.body()[0].as_str());
/// # Ok(()) }
/// ```
pub struct Proxy {
    conn: Connection,
    destination: String,
    path: ObjectPathBuf,
    interface: String,
    methods: Vec<ProxyMethod>,
    signals: Vec<ProxySignal>,
}

impl Proxy {
    /// Fetch the raw introspection document of a remote object.
    pub async fn introspect(
        conn: &Connection,
        destination: &str,
        path: &ObjectPath,
    ) -> Result<String> {
        let m = Message::method_call(path, "Introspect")
            .with_interface(INTROSPECTABLE)
            .with_destination(destination);

        let reply = conn.call(m).await?.await?;

        match reply.into_body().into_iter().next() {
            Some(Value::String(xml)) => Ok(xml),
            _ => Err(Error::new(ErrorKind::InvalidProtocol)),
        }
    }

    /// Introspect the remote object and build a proxy for one of its
    /// interfaces.
    pub async fn new(
        conn: &Connection,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
    ) -> Result<Proxy> {
        let xml = Self::introspect(conn, destination, path).await?;
        Self::from_xml(conn, destination, path, interface, &xml)
    }

    /// Build a proxy from an introspection document already at hand.
    pub fn from_xml(
        conn: &Connection,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        xml: &str,
    ) -> Result<Proxy> {
        let (methods, signals) = parse_interface(xml, interface)?;

        Ok(Proxy {
            conn: conn.clone(),
            destination: destination.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            methods,
            signals,
        })
    }

    /// The destination the proxy calls.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The remote object path.
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The proxied interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The discovered methods.
    pub fn methods(&self) -> &[ProxyMethod] {
        &self.methods
    }

    /// The declared signals.
    pub fn signals(&self) -> &[ProxySignal] {
        &self.signals
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&ProxyMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Call a discovered method with positional arguments.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Reply> {
        let Some(method) = self.method(member) else {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        };

        let expected = method.args.iter().count();

        if expected != args.len() {
            return Err(Error::new(ErrorKind::ArgumentCount {
                expected,
                actual: args.len(),
            }));
        }

        let mut m = Message::method_call(&self.path, member)
            .with_interface(&self.interface)
            .with_destination(&self.destination);

        if !method.args.is_empty() {
            m = m.with_body(method.args.as_str(), args)?;
        }

        self.conn.call(m).await?.await
    }

    /// Subscribe to one of the declared signals, returning a queue fed by
    /// signals from the proxied path and interface.
    pub async fn subscribe(&self, member: &str) -> Result<SignalQueue> {
        if !self.signals.iter().any(|s| s.name == member) {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        }

        let queue = self.conn.new_queue(DEFAULT_QUEUE_SIZE)?;

        queue
            .add(
                Condition::new()
                    .path(self.path.as_str())
                    .interface(&self.interface)
                    .member(member),
            )
            .await?;

        Ok(queue)
    }
}

enum Elem {
    Node,
    Interface { keep: bool },
    Method { name: String, args: String, result: String },
    Signal { name: String, args: String },
    Arg { direction: Option<String>, ty: Option<String> },
    Other,
}

/// Extract the methods and signals of one interface out of an
/// introspection document.
///
/// The parser is deliberately tolerant: properties, annotations, nested
/// node references and unknown elements are skipped.
fn parse_interface(
    xml: &str,
    interface: &str,
) -> Result<(Vec<ProxyMethod>, Vec<ProxySignal>)> {
    let mut methods = Vec::new();
    let mut signals = Vec::new();

    let mut stack: Vec<Elem> = Vec::new();
    let mut pending: Option<Elem> = None;
    let mut found = false;

    for token in Tokenizer::from(xml) {
        let token = token.map_err(|e| Error::new(ErrorKind::Xml(e)))?;

        match token {
            Token::ElementStart { local, .. } => {
                let elem = match (stack.last(), local.as_str()) {
                    (None, "node") => Elem::Node,
                    (Some(Elem::Node), "interface") => Elem::Interface { keep: false },
                    (Some(Elem::Interface { keep: true }), "method") => Elem::Method {
                        name: String::new(),
                        args: String::new(),
                        result: String::new(),
                    },
                    (Some(Elem::Interface { keep: true }), "signal") => Elem::Signal {
                        name: String::new(),
                        args: String::new(),
                    },
                    (Some(Elem::Method { .. } | Elem::Signal { .. }), "arg") => Elem::Arg {
                        direction: None,
                        ty: None,
                    },
                    _ => Elem::Other,
                };

                pending = Some(elem);
            }
            Token::Attribute { local, value, .. } => {
                match pending.as_mut() {
                    Some(Elem::Interface { keep }) if local.as_str() == "name" => {
                        *keep = value.as_str() == interface;
                    }
                    Some(Elem::Method { name, .. } | Elem::Signal { name, .. })
                        if local.as_str() == "name" =>
                    {
                        *name = value.as_str().to_owned();
                    }
                    Some(Elem::Arg { direction, .. }) if local.as_str() == "direction" => {
                        *direction = Some(value.as_str().to_owned());
                    }
                    Some(Elem::Arg { ty, .. }) if local.as_str() == "type" => {
                        *ty = Some(value.as_str().to_owned());
                    }
                    _ => {}
                }
            }
            Token::ElementEnd { end, .. } => match end {
                ElementEnd::Open => {
                    if let Some(elem) = pending.take() {
                        stack.push(elem);
                    }
                }
                ElementEnd::Empty => {
                    if let Some(elem) = pending.take() {
                        finish(elem, &mut stack, &mut methods, &mut signals, &mut found)?;
                    }
                }
                ElementEnd::Close(..) => {
                    // A close without a matching open is tolerated; stray
                    // markup is the server's problem.
                    if let Some(elem) = stack.pop() {
                        finish(elem, &mut stack, &mut methods, &mut signals, &mut found)?;
                    }
                }
            },
            _ => {}
        }
    }

    if !found {
        return Err(Error::new(ErrorKind::MissingInterface(interface.into())));
    }

    Ok((methods, signals))
}

fn finish(
    elem: Elem,
    stack: &mut [Elem],
    methods: &mut Vec<ProxyMethod>,
    signals: &mut Vec<ProxySignal>,
    found: &mut bool,
) -> Result<()> {
    match elem {
        Elem::Arg { direction, ty } => {
            let Some(ty) = ty else {
                return Ok(());
            };

            // Each argument carries exactly one complete type.
            let signature = Signature::from_str(&ty)?;
            signature.ensure_single_complete()?;

            match stack.last_mut() {
                Some(Elem::Method { args, result, .. }) => {
                    if direction.as_deref() == Some("out") {
                        result.push_str(&ty);
                    } else {
                        args.push_str(&ty);
                    }
                }
                Some(Elem::Signal { args, .. }) => {
                    args.push_str(&ty);
                }
                _ => {}
            }
        }
        Elem::Method { name, args, result } => {
            methods.push(ProxyMethod {
                name,
                args: SignatureBuf::from_str(&args)?,
                result: SignatureBuf::from_str(&result)?,
            });
        }
        Elem::Signal { name, args } => {
            signals.push(ProxySignal {
                name,
                args: SignatureBuf::from_str(&args)?,
            });
        }
        Elem::Interface { keep } => {
            *found |= keep;
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::connection::tests::client_and_daemon;
    use crate::{ExportObject, ObjectPath, Proxy, Value};

    use super::parse_interface;

    const DAEMON_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
 <interface name="org.freedesktop.DBus">
  <method name="Hello">
   <arg direction="out" type="s"/>
  </method>
  <method name="RequestName">
   <arg direction="in" type="s"/>
   <arg direction="in" type="u"/>
   <arg direction="out" type="u"/>
  </method>
  <method name="GetConnectionCredentials">
   <arg direction="in" type="s"/>
   <arg direction="out" type="a{sv}"/>
  </method>
  <property name="Features" type="as" access="read"/>
  <signal name="NameOwnerChanged">
   <arg type="s"/>
   <arg type="s"/>
   <arg type="s"/>
  </signal>
  <annotation name="org.freedesktop.DBus.Deprecated" value="false"/>
 </interface>
 <interface name="org.freedesktop.DBus.Monitoring">
  <method name="BecomeMonitor">
   <arg direction="in" type="as"/>
   <arg direction="in" type="u"/>
  </method>
 </interface>
 <node name="child"/>
</node>"#;

    #[test]
    fn parse_daemon_document() {
        let (methods, signals) = parse_interface(DAEMON_XML, "org.freedesktop.DBus").unwrap();

        assert_eq!(methods.len(), 3);

        let hello = &methods[0];
        assert_eq!(hello.name(), "Hello");
        assert_eq!(hello.args().as_str(), "");
        assert_eq!(hello.result().as_str(), "s");

        let request_name = &methods[1];
        assert_eq!(request_name.name(), "RequestName");
        assert_eq!(request_name.args().as_str(), "su");
        assert_eq!(request_name.result().as_str(), "u");

        let credentials = &methods[2];
        assert_eq!(credentials.args().as_str(), "s");
        assert_eq!(credentials.result().as_str(), "a{sv}");

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].name(), "NameOwnerChanged");
        assert_eq!(signals[0].args().as_str(), "sss");
    }

    #[test]
    fn parse_other_interface() {
        let (methods, signals) =
            parse_interface(DAEMON_XML, "org.freedesktop.DBus.Monitoring").unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].args().as_str(), "asu");
        assert!(signals.is_empty());
    }

    #[test]
    fn missing_interface() {
        assert!(parse_interface(DAEMON_XML, "no.such.Interface").is_err());
    }

    #[tokio::test]
    async fn proxy_end_to_end() {
        let (client, peer, _) = client_and_daemon().await;

        let path = ObjectPath::new_const("/foo/bar");

        let object = ExportObject::new()
            .method("foo.bar", "Echo", "s", "s", |args| {
                let text = args[0].as_str().unwrap_or_default();
                Ok(vec![Value::from(format!("{text} world"))])
            })
            .unwrap()
            .signal("foo.bar", "Testing", "s")
            .unwrap();

        client.attach(path, object).unwrap();

        let proxy = Proxy::new(&peer, ":1.7", path, "foo.bar").await.unwrap();

        assert!(proxy.method("Echo").is_some());
        assert_eq!(proxy.signals().len(), 1);

        let reply = proxy.call("Echo", vec![Value::from("hello")]).await.unwrap();
        assert_eq!(reply.body(), [Value::from("hello world")]);

        // Wrong arity is rejected before anything is sent.
        assert!(proxy.call("Echo", vec![]).await.is_err());
        assert!(proxy.call("Nope", vec![]).await.is_err());

        client.close().await;
        peer.close().await;
    }
}
