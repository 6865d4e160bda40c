pub use self::connection::{Connection, PendingReply, Reply};
pub(crate) use self::connection::DEFAULT_QUEUE_SIZE;
mod connection;

pub(crate) use self::matches::MatchRegistry;
mod matches;

#[cfg(test)]
pub(crate) mod tests;

use crate::address::{self, BusAddress};
use crate::error::ErrorKind;
use crate::sasl::{self, AuthMethod};
use crate::{Error, Result};

#[derive(Clone)]
enum BusKind {
    Session,
    System,
    Addresses(Vec<BusAddress>),
}

/// Builder of a [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use busmux::ConnectionBuilder;
///
/// # #[tokio::main] async fn main() -> busmux::Result<()> {
/// let c = ConnectionBuilder::new().system_bus().build().await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct ConnectionBuilder {
    bus: BusKind,
    methods: Vec<AuthMethod>,
}

impl ConnectionBuilder {
    /// Construct a new [`ConnectionBuilder`] with the default configuration:
    /// the session bus with the default authentication methods.
    pub fn new() -> Self {
        Self {
            bus: BusKind::Session,
            methods: AuthMethod::DEFAULT.to_vec(),
        }
    }

    /// Connect to the session bus (default).
    #[must_use]
    pub fn session_bus(mut self) -> Self {
        self.bus = BusKind::Session;
        self
    }

    /// Connect to the system bus.
    #[must_use]
    pub fn system_bus(mut self) -> Self {
        self.bus = BusKind::System;
        self
    }

    /// Connect to an explicit sequence of endpoints, tried in order.
    #[must_use]
    pub fn addresses(mut self, addresses: Vec<BusAddress>) -> Self {
        self.bus = BusKind::Addresses(addresses);
        self
    }

    /// Restrict the authentication methods attempted during the handshake.
    #[must_use]
    pub fn auth_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.methods = methods;
        self
    }

    /// Connect and authenticate a [`Connection`] with the current
    /// configuration.
    pub async fn build(&self) -> Result<Connection> {
        let addresses = match &self.bus {
            BusKind::Session => address::session_addresses(),
            BusKind::System => address::system_addresses(),
            BusKind::Addresses(addresses) => addresses.clone(),
        };

        connect_with(addresses, &self.methods).await
    }
}

impl Default for ConnectionBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to the first endpoint in the sequence which accepts a connection
/// and authenticates, then perform the `Hello` setup.
pub async fn connect_bus(
    addresses: impl IntoIterator<Item = BusAddress>,
) -> Result<Connection> {
    connect_with(addresses, AuthMethod::DEFAULT).await
}

async fn connect_with(
    addresses: impl IntoIterator<Item = BusAddress>,
    methods: &[AuthMethod],
) -> Result<Connection> {
    for address in addresses {
        tracing::debug!("trying bus {address:?}");

        let mut stream = match address.connect().await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::debug!("cannot attach to {address:?}: {error}");
                continue;
            }
        };

        if let Err(error) = sasl::authenticate(&mut stream, methods).await {
            tracing::debug!("cannot authenticate with {address:?}: {error}");
            continue;
        }

        tracing::debug!("authenticated with bus {address:?}");

        let conn = Connection::from_stream(stream);

        match conn.setup().await {
            Ok(()) => return Ok(conn),
            Err(error) => {
                conn.close().await;
                return Err(error);
            }
        }
    }

    Err(Error::new(ErrorKind::MissingBus))
}
