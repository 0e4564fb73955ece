//! Remote access layer.
//!
//! A backend process hosts the authoritative components in a [`ComponentRegistry`] and
//! exposes them with a [`ComponentServer`]. Clients reach them through
//! [`ComponentProxy`] (one component) or [`RemoteBackend`] (every component over one
//! [`Connection`]); both implement the ordinary [`Component`] interface.
//!
//! [`ComponentRegistry`]: crate::registry::ComponentRegistry
//! [`Component`]: crate::component::Component

pub mod connection;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use connection::{Connection, ConnectionState};
pub use protocol::{ClientFrame, Reply, Request, ServerFrame};
pub use proxy::{AttributeProxy, ComponentProxy, RemoteBackend};
pub use server::ComponentServer;
