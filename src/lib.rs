//! Asynchronous client-side D-Bus library for the Tokio ecosystem.
//!
//! This crate opens a transport to a local bus daemon, authenticates,
//! serializes and deserializes D-Bus wire messages, and multiplexes
//! concurrent method calls and signal subscriptions over one connection.
//! Incoming method calls are dispatched to locally-exported objects, and
//! remote services can be driven through introspection-built proxies.
//!
//! The entry point is [`Connection`]:
//!
//! ```no_run
//! use busmux::Connection;
//!
//! # #[tokio::main] async fn main() -> busmux::Result<()> {
//! let c = Connection::session_bus().await?;
//!
//! for name in c.daemon().list_names().await? {
//!     println!("{name}");
//! }
//!
//! c.close().await;
//! # Ok(()) }
//! ```

#![allow(clippy::module_inception)]

#[macro_use]
pub mod proto;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::signature::{Signature, SignatureBuf, SignatureError};
mod signature;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathBuf, ObjectPathError};
mod object_path;

#[doc(inline)]
pub use self::value::Value;
mod value;

pub mod codec;

#[doc(inline)]
pub use self::message::{BusEvent, Message, MessageKind};
mod message;

mod frame;

#[doc(inline)]
pub use self::address::BusAddress;
mod address;

pub mod sasl;

#[doc(inline)]
pub use self::connection::{connect_bus, Connection, ConnectionBuilder, PendingReply, Reply};
mod connection;

#[doc(inline)]
pub use self::signal::{Condition, QueueItem, QueueState, SignalQueue};
mod signal;

#[doc(inline)]
pub use self::export::{ExportObject, MethodReply};
mod export;

pub mod daemon;

#[doc(inline)]
pub use self::proxy::{Proxy, ProxyMethod, ProxySignal};
mod proxy;

#[doc(inline)]
pub use self::persist::PersistentConnection;
mod persist;

mod utils;
