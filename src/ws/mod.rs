//! Relay transport.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the socket, with heartbeat and reconnection
//! - [`Lifecycle`]: state machine turning socket events into [`ConnectionState`] changes,
//!   Event Bus emissions and user notices
//! - [`endpoint`]: relay addresses and the connection string
//!
//! Most hosts never touch this module directly; [`Session`](crate::session::Session)
//! wires it up.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;

pub use config::{Config, ReconnectConfig, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionState, Lifecycle};
pub use endpoint::{Credentials, Endpoint};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
