use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::proto;
use crate::{ObjectPathError, SignatureError};

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Construct an error carrying a remote D-Bus error.
    pub(crate) fn remote(name: impl Into<Box<str>>, message: Option<Box<str>>) -> Error {
        Self::new(ErrorKind::Remote {
            name: name.into(),
            message,
        })
    }

    /// The name of the remote D-Bus error, if this is one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use busmux::{daemon, Connection, Message};
    ///
    /// # #[tokio::main] async fn main() -> busmux::Result<()> {
    /// let c = Connection::session_bus().await?;
    ///
    /// let m = Message::method_call(daemon::PATH, "NoSuchMethod")
    ///     .with_interface(daemon::INTERFACE)
    ///     .with_destination(daemon::DESTINATION);
    ///
    /// let e = c.call(m).await?.await.unwrap_err();
    /// assert_eq!(e.remote_name(), Some("org.freedesktop.DBus.Error.UnknownMethod"));
    /// # Ok(()) }
    /// ```
    pub fn remote_name(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The human-readable message of the remote D-Bus error, if any.
    pub fn remote_message(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Remote { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    /// Test if the error was caused by the connection being closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionClosed)
    }

    /// Test if the error indicates that the connection was lost before a
    /// reply arrived.
    pub fn is_no_reply(&self) -> bool {
        matches!(self.kind, ErrorKind::NoReply)
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::ObjectPath(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(..) => write!(f, "I/O error"),
            ErrorKind::Signature(..) => write!(f, "Signature error"),
            ErrorKind::ObjectPath(..) => write!(f, "ObjectPath error"),
            ErrorKind::Utf8Error(..) => write!(f, "UTF-8 error"),
            ErrorKind::ShortBuffer => write!(f, "Decoder ran out of input"),
            ErrorKind::TrailingBytes => {
                write!(f, "Buffer not fully consumed by decoded signature")
            }
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::InvalidBoolean(value) => {
                write!(f, "Boolean value {value} is neither 0 nor 1")
            }
            ErrorKind::MismatchedValue(ty) => {
                write!(f, "Value does not fit signature element {ty:?}")
            }
            ErrorKind::CannotInferVariant => {
                write!(f, "Cannot infer a variant signature for value")
            }
            ErrorKind::ArrayOutOfBounds(length) => {
                write!(f, "Array of length {length} exceeds remaining buffer")
            }
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::HeaderTooLong(length) => {
                write!(f, "Header of length {length} is too long (max is 67108864)")
            }
            ErrorKind::InvalidProtocol => write!(f, "Invalid protocol"),
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingReplySerial => {
                write!(f, "Missing required REPLY_SERIAL header")
            }
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
            ErrorKind::MissingBodySignature => {
                write!(f, "Non-empty body without a SIGNATURE header")
            }
            ErrorKind::MissingBus => write!(f, "Missing bus to connect to"),
            ErrorKind::InvalidAddress => write!(f, "Invalid d-bus address"),
            ErrorKind::InvalidSasl => write!(f, "Invalid SASL message"),
            ErrorKind::AuthRejected => {
                write!(f, "All supported authentication methods rejected")
            }
            ErrorKind::ConnectionClosed => write!(f, "Connection closed"),
            ErrorKind::NoReply => write!(f, "Connection closed before reply arrived"),
            ErrorKind::Remote { name, message } => match message {
                Some(message) => write!(f, "{name}: {message}"),
                None => write!(f, "{name}"),
            },
            ErrorKind::AlreadyExported(path) => {
                write!(f, "An object is already exported at {path}")
            }
            ErrorKind::NotExported(path) => {
                write!(f, "No object exported at {path}")
            }
            ErrorKind::WellKnownSender(name) => {
                write!(
                    f,
                    "sender='{name}' cannot match; signals carry unique sender names"
                )
            }
            ErrorKind::Xml(..) => write!(f, "Malformed introspection document"),
            ErrorKind::MissingInterface(name) => {
                write!(f, "Introspection document has no interface {name}")
            }
            ErrorKind::UnknownMember(name) => {
                write!(f, "Proxy has no member {name}")
            }
            ErrorKind::UnknownCondition => {
                write!(f, "Condition was not added to this queue")
            }
            ErrorKind::ArgumentCount { expected, actual } => {
                write!(f, "Expected {expected} argument(s), got {actual}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::ObjectPath(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            ErrorKind::Xml(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    ObjectPath(ObjectPathError),
    Utf8Error(Utf8Error),
    ShortBuffer,
    TrailingBytes,
    NotNullTerminated,
    InvalidBoolean(u32),
    MismatchedValue(proto::Type),
    CannotInferVariant,
    ArrayOutOfBounds(u32),
    ArrayTooLong(u32),
    BodyTooLong(u32),
    HeaderTooLong(u32),
    InvalidProtocol,
    ZeroSerial,
    MissingPath,
    MissingMember,
    MissingReplySerial,
    MissingErrorName,
    MissingBodySignature,
    MissingBus,
    InvalidAddress,
    InvalidSasl,
    AuthRejected,
    ConnectionClosed,
    NoReply,
    Remote {
        name: Box<str>,
        message: Option<Box<str>>,
    },
    AlreadyExported(Box<str>),
    NotExported(Box<str>),
    WellKnownSender(Box<str>),
    Xml(xmlparser::Error),
    MissingInterface(Box<str>),
    UnknownMember(Box<str>),
    UnknownCondition,
    ArgumentCount {
        expected: usize,
        actual: usize,
    },
}
