#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod envelope;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod session;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use envelope::{Envelope, EventKind, Packet, PacketRegistry};
pub use events::EventBus;
pub use session::Session;

/// Paths used by the exported packet macros. Not part of the public API.
#[doc(hidden)]
pub mod __private {
    pub use prost;
    pub use serde_json;
}
