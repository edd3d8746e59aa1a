//! Wire envelope exchanged with the relay.
//!
//! Every frame on the socket is one protobuf-encoded [`Envelope`]: routing metadata
//! (`module`, `event`) plus an optional typed packet (`packet_type`, `packet_value`).
//! The relay only looks at the metadata; packets are opaque to it and are decoded by
//! receivers that recognise the tag.
//!
//! ```
//! use global_relay_client::envelope::Envelope;
//!
//! let bytes = Envelope::broadcast("chat").serialize_with(&"hello".to_owned())?;
//!
//! let envelope = Envelope::deserialize(&bytes)?;
//! assert_eq!(envelope.module, "chat");
//! assert_eq!(envelope.deserialize_packet::<String>()?, Some("hello".to_owned()));
//! assert_eq!(envelope.deserialize_packet::<i64>()?, None);
//! # Ok::<(), global_relay_client::error::Error>(())
//! ```

mod packet;

use prost::Message as _;

pub use packet::{Packet, PacketRegistry};

use crate::Result;

/// Default module the connection itself is registered under.
pub const CORE_MODULE: &str = "core";

/// `packet_type` written by [`Envelope::serialize`] when no packet is attached.
pub const NO_PAYLOAD_TYPE: &str = <Vec<u8> as Packet>::PACKET_TYPE;

/// What the relay should do with an envelope.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    /// Relay the packet to every subscriber of the module
    Broadcast,
    /// Register this connection as a subscriber of the module
    Subscribe,
}

impl EventKind {
    /// The string written to the `event` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Subscribe => "subscribe",
        }
    }

    /// Parse a wire `event` string. Unknown values yield `None`.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "broadcast" => Some(Self::Broadcast),
            "subscribe" => Some(Self::Subscribe),
            _ => None,
        }
    }
}

/// Unit of exchange with the relay.
///
/// Built fresh for each outbound operation and consumed when serialized, so an envelope
/// is never modified after it has been handed to the transport.
#[non_exhaustive]
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Routing key. Empty means the default (`core`) module.
    #[prost(string, tag = "1")]
    pub module: String,
    /// Raw event string, see [`Envelope::event_kind`].
    #[prost(string, tag = "2")]
    pub event: String,
    /// Tag of the carried packet, empty until a packet is attached.
    #[prost(string, tag = "3")]
    pub packet_type: String,
    /// Encoded packet, empty when none is attached.
    #[prost(bytes = "vec", tag = "4")]
    pub packet_value: Vec<u8>,
}

impl Envelope {
    #[must_use]
    pub fn new<S: Into<String>>(event: EventKind, module: S) -> Self {
        Self {
            module: module.into(),
            event: event.as_str().to_owned(),
            packet_type: String::new(),
            packet_value: Vec::new(),
        }
    }

    #[must_use]
    pub fn broadcast<S: Into<String>>(module: S) -> Self {
        Self::new(EventKind::Broadcast, module)
    }

    #[must_use]
    pub fn subscribe<S: Into<String>>(module: S) -> Self {
        Self::new(EventKind::Subscribe, module)
    }

    /// Typed view of [`Envelope::event`]; `None` for events this client does not know.
    #[must_use]
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_wire(&self.event)
    }

    /// The module, with the empty string resolved to [`CORE_MODULE`].
    #[must_use]
    pub fn module_or_default(&self) -> &str {
        if self.module.is_empty() {
            CORE_MODULE
        } else {
            &self.module
        }
    }

    /// Whether a packet other than the empty placeholder is attached.
    ///
    /// The placeholder shares its tag with `Vec<u8>` packets, so an empty byte-vector
    /// broadcast also counts as no packet.
    #[must_use]
    pub fn has_packet(&self) -> bool {
        !self.packet_type.is_empty()
            && (self.packet_type != NO_PAYLOAD_TYPE || !self.packet_value.is_empty())
    }

    /// Attach `packet` and serialize the whole envelope.
    ///
    /// The packet is only borrowed. Codec failures are returned as
    /// [`Encoding`](crate::error::Kind::Encoding) errors.
    pub fn serialize_with<P: Packet>(mut self, packet: &P) -> Result<Vec<u8>> {
        self.packet_value = packet.encode_packet()?;
        P::PACKET_TYPE.clone_into(&mut self.packet_type);
        Ok(self.encode_to_vec())
    }

    /// Serialize an envelope that carries no packet, such as a subscribe request.
    #[must_use]
    pub fn serialize(mut self) -> Vec<u8> {
        NO_PAYLOAD_TYPE.clone_into(&mut self.packet_type);
        self.packet_value.clear();
        self.encode_to_vec()
    }

    /// Parse an envelope received from the relay.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    /// Extract the packet as `P`.
    ///
    /// Returns `Ok(None)` when the envelope carries a different packet type; that is the
    /// normal outcome for listeners that only care about some of the traffic. An error is
    /// only returned when the tag matches but the bytes do not decode.
    pub fn deserialize_packet<P: Packet>(&self) -> Result<Option<P>> {
        if self.packet_type != P::PACKET_TYPE {
            return Ok(None);
        }

        P::decode_packet(&self.packet_value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::Kind;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Position {
        #[prost(sint32, tag = "1")]
        x: i32,
        #[prost(sint32, tag = "2")]
        y: i32,
        #[prost(string, tag = "3")]
        world: String,
    }

    crate::prost_packet!(Position => "test.Position");

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        sender: String,
        text: String,
    }

    crate::json_packet!(ChatLine => "test.ChatLine");

    #[derive(Debug, Serialize, Deserialize)]
    struct Unencodable {
        by_pair: std::collections::HashMap<(u8, u8), u8>,
    }

    crate::json_packet!(Unencodable => "test.Unencodable");

    #[test]
    fn chat_broadcast_round_trip() {
        let bytes = Envelope::new(EventKind::Broadcast, "chat")
            .serialize_with(&"hello".to_owned())
            .unwrap();

        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.module, "chat");
        assert_eq!(envelope.event, "broadcast");
        assert_eq!(envelope.event_kind(), Some(EventKind::Broadcast));
        assert_eq!(envelope.packet_type, "System.String");
        assert!(envelope.has_packet());
        assert_eq!(
            envelope.deserialize_packet::<String>().unwrap(),
            Some("hello".to_owned())
        );
    }

    #[test]
    fn prost_packet_round_trip() {
        let position = Position {
            x: -12,
            y: 340,
            world: "overworld".to_owned(),
        };

        let bytes = Envelope::broadcast("maps").serialize_with(&position).unwrap();
        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.packet_type, "test.Position");
        assert_eq!(envelope.deserialize_packet::<Position>().unwrap(), Some(position));
    }

    #[test]
    fn json_packet_round_trip() {
        let line = ChatLine {
            sender: "tyron".to_owned(),
            text: "anyone near the lake?".to_owned(),
        };

        let bytes = Envelope::broadcast("chat").serialize_with(&line).unwrap();
        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.deserialize_packet::<ChatLine>().unwrap(), Some(line));
    }

    #[test]
    fn mismatched_packet_type_is_absent() {
        let bytes = Envelope::broadcast("chat")
            .serialize_with(&"hello".to_owned())
            .unwrap();
        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.deserialize_packet::<i32>().unwrap(), None);
        assert_eq!(envelope.deserialize_packet::<Position>().unwrap(), None);
        assert_eq!(envelope.deserialize_packet::<ChatLine>().unwrap(), None);
    }

    #[test]
    fn subscribe_uses_no_payload_sentinel() {
        let bytes = Envelope::subscribe("chat").serialize();
        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.event_kind(), Some(EventKind::Subscribe));
        assert_eq!(envelope.packet_type, NO_PAYLOAD_TYPE);
        assert!(envelope.packet_value.is_empty());
        assert!(!envelope.has_packet());
    }

    #[test]
    fn subscribe_wire_layout() {
        let bytes = Envelope::subscribe("chat").serialize();

        let mut expected = vec![0x0A, 4];
        expected.extend_from_slice(b"chat");
        expected.extend_from_slice(&[0x12, 9]);
        expected.extend_from_slice(b"subscribe");
        expected.extend_from_slice(&[0x1A, 13]);
        expected.extend_from_slice(b"System.Byte[]");

        assert_eq!(bytes, expected);
    }

    #[test]
    fn empty_input_decodes_to_defaults() {
        let envelope = Envelope::deserialize(&[]).unwrap();

        assert_eq!(envelope.module, "");
        assert_eq!(envelope.module_or_default(), CORE_MODULE);
        assert_eq!(envelope.event_kind(), None);
        assert_eq!(envelope.packet_type, "");
        assert!(envelope.packet_value.is_empty());
    }

    #[test]
    fn byte_vector_broadcast_has_packet() {
        let bytes = Envelope::broadcast("blobs")
            .serialize_with(&vec![1_u8, 2, 3])
            .unwrap();
        let envelope = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(envelope.packet_type, NO_PAYLOAD_TYPE);
        assert!(envelope.has_packet());
        assert_eq!(
            envelope.deserialize_packet::<Vec<u8>>().unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn malformed_input_is_decoding_error() {
        let error = Envelope::deserialize(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert_eq!(error.kind(), Kind::Decoding);

        let error = Envelope::deserialize(&[0x0A, 0x05, b'c']).unwrap_err();
        assert_eq!(error.kind(), Kind::Decoding);
    }

    #[test]
    fn unencodable_packet_is_encoding_error() {
        let mut by_pair = std::collections::HashMap::new();
        by_pair.insert((1, 2), 3);

        let error = Envelope::broadcast("chat")
            .serialize_with(&Unencodable { by_pair })
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Encoding);
    }

    #[test]
    fn event_kind_display_matches_wire() {
        assert_eq!(EventKind::Broadcast.to_string(), EventKind::Broadcast.as_str());
        assert_eq!(EventKind::Subscribe.to_string(), "subscribe");
        assert_eq!(EventKind::from_wire("unsubscribe"), None);
    }
}
