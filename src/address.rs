//! Bus endpoint descriptors and discovery.

use std::env;
use std::fs;
use std::path::PathBuf;

use tokio::net::UnixStream;

use crate::error::ErrorKind;
use crate::{Error, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";
const SESSION_BUS_DIR: &str = ".dbus/session-bus";

/// The address of a bus endpoint.
///
/// Addresses are parsed from the textual `unix:key=value,…` form used by
/// `DBUS_SESSION_BUS_ADDRESS` and the session-bus files.
///
/// # Examples
///
/// ```
/// use busmux::BusAddress;
///
/// let address = BusAddress::parse("unix:path=/run/user/1000/bus")?;
/// assert!(matches!(address, BusAddress::Unix { .. }));
///
/// let address = BusAddress::parse("unix:abstract=/tmp/dbus-abc,guid=0")?;
/// assert!(matches!(address, BusAddress::Abstract { .. }));
/// # Ok::<_, busmux::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusAddress {
    /// A filesystem unix socket.
    Unix {
        /// Path to the socket.
        path: PathBuf,
    },
    /// An abstract-namespace unix socket (Linux only). The leading zero byte
    /// is added when connecting.
    Abstract {
        /// The abstract socket name, without the leading zero byte.
        name: Vec<u8>,
    },
}

impl BusAddress {
    /// Parse a single address out of its textual form.
    pub fn parse(address: &str) -> Result<BusAddress> {
        let Some(rest) = address.strip_prefix("unix:") else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        for pair in rest.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            match key {
                "path" => {
                    return Ok(BusAddress::Unix {
                        path: PathBuf::from(value),
                    });
                }
                "abstract" => {
                    return Ok(BusAddress::Abstract {
                        name: value.as_bytes().to_vec(),
                    });
                }
                _ => {}
            }
        }

        Err(Error::new(ErrorKind::InvalidAddress))
    }

    /// Parse a `;`-separated address list, keeping the addresses which use a
    /// supported transport.
    pub fn parse_list(addresses: &str) -> Vec<BusAddress> {
        addresses
            .split(';')
            .filter_map(|a| Self::parse(a).ok())
            .collect()
    }

    /// Open a connection to the endpoint.
    pub(crate) async fn connect(&self) -> Result<UnixStream> {
        match self {
            BusAddress::Unix { path } => Ok(UnixStream::connect(path).await?),
            #[cfg(target_os = "linux")]
            BusAddress::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
                let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                stream.set_nonblocking(true)?;
                Ok(UnixStream::from_std(stream)?)
            }
            #[cfg(not(target_os = "linux"))]
            BusAddress::Abstract { .. } => Err(Error::new(ErrorKind::InvalidAddress)),
        }
    }
}

/// Candidate session bus addresses, most specific first.
///
/// The `DBUS_SESSION_BUS_ADDRESS` environment variable wins; otherwise every
/// file under `~/.dbus/session-bus/` is scanned for its recorded address.
pub(crate) fn session_addresses() -> Vec<BusAddress> {
    if let Ok(address) = env::var(ENV_SESSION_BUS) {
        return BusAddress::parse_list(&address);
    }

    let mut addresses = Vec::new();

    let Some(home) = env::var_os("HOME") else {
        return addresses;
    };

    let dir = PathBuf::from(home).join(SESSION_BUS_DIR);

    let Ok(entries) = fs::read_dir(dir) else {
        return addresses;
    };

    for entry in entries.flatten() {
        let Ok(contents) = fs::read_to_string(entry.path()) else {
            continue;
        };

        for line in contents.lines() {
            if let Some(address) = line.strip_prefix("DBUS_SESSION_BUS_ADDRESS=") {
                addresses.extend(BusAddress::parse_list(address.trim()));
                break;
            }
        }
    }

    addresses
}

/// Candidate system bus addresses: the well-known socket path.
pub(crate) fn system_addresses() -> Vec<BusAddress> {
    BusAddress::parse_list(DEFAULT_SYSTEM_BUS)
}
