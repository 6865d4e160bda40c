use std::num::NonZeroU32;

use crate::proto::{Flags, MessageType};
use crate::{ObjectPath, ObjectPathBuf, Signature, SignatureBuf, Value};

/// The kind of an outbound D-Bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// Method call. This message type may prompt a reply.
    MethodCall {
        /// The path being called.
        path: ObjectPathBuf,
        /// The member being called.
        member: String,
    },
    /// Method reply with returned data.
    MethodReturn {
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Error reply.
    Error {
        /// The name of the error.
        error_name: String,
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Signal emission.
    Signal {
        /// The path the signal is emitted from.
        path: ObjectPathBuf,
        /// The member being signalled.
        member: String,
    },
}

/// An outbound D-Bus message.
///
/// The serial number is not part of the message; it is assigned by the
/// connection when the message is written to the transport.
///
/// # Examples
///
/// ```
/// use busmux::{Message, ObjectPath, Value};
///
/// const PATH: &ObjectPath = ObjectPath::new_const("/org/freedesktop/DBus");
///
/// let m = Message::method_call(PATH, "RequestName")
///     .with_interface("org.freedesktop.DBus")
///     .with_destination("org.freedesktop.DBus")
///     .with_body("su", vec![Value::from("foo.bar"), Value::UInt32(4)])?;
///
/// assert_eq!(m.signature().as_str(), "su");
/// # Ok::<_, busmux::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) flags: Flags,
    pub(crate) interface: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) signature: SignatureBuf,
    pub(crate) body: Vec<Value>,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            signature: SignatureBuf::empty(),
            body: Vec::new(),
        }
    }

    /// Construct a method call message.
    pub fn method_call(path: &ObjectPath, member: &str) -> Self {
        Self::new(MessageKind::MethodCall {
            path: path.to_owned(),
            member: member.to_owned(),
        })
    }

    /// Construct a signal message.
    pub fn signal(path: &ObjectPath, member: &str) -> Self {
        Self::new(MessageKind::Signal {
            path: path.to_owned(),
            member: member.to_owned(),
        })
    }

    /// Construct a method return replying to the given serial.
    pub fn method_return(reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::MethodReturn { reply_serial })
    }

    /// Construct an error replying to the given serial.
    pub fn error(error_name: &str, reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::Error {
            error_name: error_name.to_owned(),
            reply_serial,
        })
    }

    /// Get the kind of the message.
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Modify the flags of the message.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Get the interface of the message.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Modify the interface of the message.
    #[must_use]
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    /// Get the destination of the message.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Modify the destination of the message.
    #[must_use]
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_owned());
        self
    }

    /// Modify the sender of the message.
    ///
    /// The bus daemon overwrites this with the sending connection's unique
    /// name; setting it is only meaningful off-bus.
    #[must_use]
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Get the body signature of the message.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Set the body of the message, with the signature describing it.
    pub fn with_body(
        mut self,
        signature: &str,
        body: Vec<Value>,
    ) -> crate::Result<Self> {
        self.signature = SignatureBuf::from_str(signature)?;
        self.body = body;
        Ok(self)
    }

    pub(crate) fn message_type(&self) -> MessageType {
        match self.kind {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }
}

/// A decoded inbound bus message.
///
/// Events are handed to pending reply slots, matched against subscriber
/// queues, and dispatched to exported objects. They should be treated as
/// immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) serial: NonZeroU32,
    pub(crate) path: Option<ObjectPathBuf>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) reply_serial: Option<NonZeroU32>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) signature: SignatureBuf,
    pub(crate) body: Vec<Value>,
}

impl BusEvent {
    /// The type of the message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The serial of the message.
    pub fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    /// The object path header, if present.
    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_deref()
    }

    /// The interface header, if present.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// The member header, if present.
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// The error name header, if present.
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// The serial this message replies to, if present.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        self.reply_serial
    }

    /// The destination header, if present.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The sender header, if present.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The signature of the body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The decoded body values.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Construct a method return replying to this event.
    pub fn method_return(&self) -> Message {
        let mut m = Message::method_return(self.serial);
        m.destination = self.sender.clone();
        m
    }

    /// Construct an error replying to this event, with the human-readable
    /// message as the body.
    pub fn error_reply(&self, error_name: &str, message: &str) -> Message {
        let mut m = Message::error(error_name, self.serial);
        m.destination = self.sender.clone();
        m.signature = Signature::STRING.to_owned();
        m.body = vec![Value::from(message)];
        m
    }
}
