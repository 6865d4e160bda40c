//! Types and calls associated with the `org.freedesktop.DBus` daemon
//! interface.

use std::fmt;

use crate::error::ErrorKind;
use crate::{Connection, Error, Message, ObjectPath, Reply, Result, Value};

/// Well known destination name.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Well known interface name.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Well known D-Bus path.
pub const PATH: &ObjectPath = ObjectPath::new_const("/org/freedesktop/DBus");

/// The standard introspection interface.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// Well-known D-Bus error names.
pub mod error_name {
    /// No handler exists for the called method.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// No object exists at the called path.
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    /// The peer disconnected before replying.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// A daemon-imposed limit was exceeded.
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    /// The call arguments did not match the method signature.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// A generic failure.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

raw_set! {
    /// The flags to a `RequestName` call.
    #[repr(u32)]
    pub enum NameFlag {
        /// Allow another application requesting the name with
        /// `REPLACE_EXISTING` to take it over.
        ALLOW_REPLACEMENT = 1,
        /// Try to replace the current owner if there is one and it
        /// specified `ALLOW_REPLACEMENT`.
        REPLACE_EXISTING = 2,
        /// Fail the request instead of queueing when the name is already
        /// owned.
        DO_NOT_QUEUE = 4,
    }
}

raw_enum! {
    /// The reply to a `RequestName` call.
    #[repr(u32)]
    pub enum NameReply {
        /// The caller is now the primary owner of the name.
        PRIMARY_OWNER = 1,
        /// The name already had an owner and the caller was placed in the
        /// waiting queue.
        IN_QUEUE = 2,
        /// The name already has an owner and `DO_NOT_QUEUE` was specified.
        EXISTS = 3,
        /// The caller already owns the name.
        ALREADY_OWNER = 4,
    }
}

raw_enum! {
    /// The reply to a `ReleaseName` call.
    #[repr(u32)]
    pub enum ReleaseNameReply {
        /// The name was released.
        RELEASED = 1,
        /// The name had no owner.
        NON_EXISTENT = 2,
        /// The caller did not own the name.
        NOT_OWNER = 3,
    }
}

/// Typed access to the bus daemon's own interface.
///
/// Constructed through [`Connection::daemon`].
///
/// # Examples
///
/// ```no_run
/// use busmux::daemon::NameFlag;
/// use busmux::Connection;
///
/// # #[tokio::main] async fn main() -> busmux::Result<()> {
/// let c = Connection::session_bus().await?;
///
/// let reply = c.daemon().request_name("foo.bar", NameFlag::DO_NOT_QUEUE).await?;
/// println!("request_name: {reply:?}");
/// # Ok(()) }
/// ```
pub struct Daemon<'a> {
    conn: &'a Connection,
}

impl<'a> Daemon<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn message(&self, member: &str) -> Message {
        Message::method_call(PATH, member)
            .with_interface(INTERFACE)
            .with_destination(DESTINATION)
    }

    async fn call(&self, message: Message) -> Result<Reply> {
        self.conn.call(message).await?.await
    }

    /// Obtain a unique name from the daemon. Performed automatically after
    /// authentication.
    pub async fn hello(&self) -> Result<String> {
        one_string(self.call(self.message("Hello")).await?)
    }

    /// List all names currently owned on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call(self.message("ListNames")).await?;

        let Some(Value::Array(values)) = reply.into_body().into_iter().next() else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(Error::new(ErrorKind::InvalidProtocol)),
            })
            .collect()
    }

    /// Request ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<NameReply> {
        let m = self.message("RequestName").with_body(
            "su",
            vec![Value::from(name), Value::UInt32(flags.0)],
        )?;

        Ok(NameReply::new(one_u32(self.call(m).await?)?))
    }

    /// Release ownership of a well-known name.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let m = self
            .message("ReleaseName")
            .with_body("s", vec![Value::from(name)])?;

        Ok(ReleaseNameReply::new(one_u32(self.call(m).await?)?))
    }

    /// The Unix uid of the connection owning the given name.
    pub async fn get_connection_unix_user(&self, name: &str) -> Result<u32> {
        let m = self
            .message("GetConnectionUnixUser")
            .with_body("s", vec![Value::from(name)])?;

        one_u32(self.call(m).await?)
    }

    /// The process id of the connection owning the given name.
    pub async fn get_connection_unix_process_id(&self, name: &str) -> Result<u32> {
        let m = self
            .message("GetConnectionUnixProcessID")
            .with_body("s", vec![Value::from(name)])?;

        one_u32(self.call(m).await?)
    }

    /// The credentials of the connection owning the given name, as reported
    /// by the daemon.
    pub async fn get_connection_credentials(
        &self,
        name: &str,
    ) -> Result<Vec<(String, Value)>> {
        let m = self
            .message("GetConnectionCredentials")
            .with_body("s", vec![Value::from(name)])?;

        let reply = self.call(m).await?;

        let Some(Value::Dict(entries)) = reply.into_body().into_iter().next() else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        entries
            .into_iter()
            .map(|(key, value)| match key {
                Value::String(key) => Ok((key, value)),
                _ => Err(Error::new(ErrorKind::InvalidProtocol)),
            })
            .collect()
    }

    /// The globally unique id of the daemon.
    pub async fn get_id(&self) -> Result<String> {
        one_string(self.call(self.message("GetId")).await?)
    }

    /// Register a match expression with the daemon.
    ///
    /// Most callers want reference-counted registration through
    /// [`SignalQueue::add`] instead.
    ///
    /// [`SignalQueue::add`]: crate::SignalQueue::add
    pub async fn add_match(&self, expr: &str) -> Result<()> {
        let m = self
            .message("AddMatch")
            .with_body("s", vec![Value::from(expr)])?;

        self.call(m).await?;
        Ok(())
    }

    /// Unregister a match expression from the daemon.
    pub async fn remove_match(&self, expr: &str) -> Result<()> {
        let m = self
            .message("RemoveMatch")
            .with_body("s", vec![Value::from(expr)])?;

        self.call(m).await?;
        Ok(())
    }
}

impl fmt::Debug for Daemon<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

fn one_string(reply: Reply) -> Result<String> {
    match reply.into_body().into_iter().next() {
        Some(Value::String(s)) => Ok(s),
        _ => Err(Error::new(ErrorKind::InvalidProtocol)),
    }
}

fn one_u32(reply: Reply) -> Result<u32> {
    match reply.into_body().into_iter().next() {
        Some(Value::UInt32(v)) => Ok(v),
        _ => Err(Error::new(ErrorKind::InvalidProtocol)),
    }
}
