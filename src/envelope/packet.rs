use std::collections::HashMap;
use std::fmt;

use super::Envelope;
use crate::Result;

/// A typed value that can travel inside an [`Envelope`].
///
/// `PACKET_TYPE` is written to the envelope's `packet_type` field on send and compared
/// verbatim on receive, so two consumers inspecting the same inbound stream can each try
/// their own type without a shared registry. Pick a tag that is unique across every
/// client sharing a module, e.g. a dotted `mod_id.TypeName`.
///
/// Use [`prost_packet!`](crate::prost_packet) for `prost` messages and
/// [`json_packet!`](crate::json_packet) for `serde` types instead of implementing this
/// by hand.
pub trait Packet: Sized + Send + 'static {
    /// Tag identifying this packet type on the wire.
    const PACKET_TYPE: &'static str;

    /// Encode the packet into the bytes stored in `packet_value`.
    fn encode_packet(&self) -> Result<Vec<u8>>;

    /// Decode the packet from `packet_value`.
    fn decode_packet(bytes: &[u8]) -> Result<Self>;
}

/// Implements [`Packet`] for one or more [`prost::Message`] types.
///
/// ```
/// use global_relay_client::prost_packet;
///
/// #[derive(Clone, PartialEq, prost::Message)]
/// pub struct Waypoint {
///     #[prost(string, tag = "1")]
///     pub name: String,
///     #[prost(sint32, tag = "2")]
///     pub x: i32,
/// }
///
/// prost_packet!(Waypoint => "mapshare.Waypoint");
/// ```
#[macro_export]
macro_rules! prost_packet {
    ($($ty:ty => $tag:expr),+ $(,)?) => {
        $(
            impl $crate::envelope::Packet for $ty {
                const PACKET_TYPE: &'static str = $tag;

                fn encode_packet(&self) -> $crate::Result<::std::vec::Vec<u8>> {
                    ::std::result::Result::Ok($crate::__private::prost::Message::encode_to_vec(self))
                }

                fn decode_packet(bytes: &[u8]) -> $crate::Result<Self> {
                    <Self as $crate::__private::prost::Message>::decode(bytes)
                        .map_err(::std::convert::Into::into)
                }
            }
        )+
    };
}

/// Implements [`Packet`] for one or more `serde` types, encoded as JSON.
///
/// Handy for prototyping; JSON encoding can fail (for example maps with non-string keys),
/// in which case `broadcast` returns an [`Encoding`](crate::error::Kind::Encoding) error.
#[macro_export]
macro_rules! json_packet {
    ($($ty:ty => $tag:expr),+ $(,)?) => {
        $(
            impl $crate::envelope::Packet for $ty {
                const PACKET_TYPE: &'static str = $tag;

                fn encode_packet(&self) -> $crate::Result<::std::vec::Vec<u8>> {
                    $crate::__private::serde_json::to_vec(self).map_err($crate::error::Error::encoding)
                }

                fn decode_packet(bytes: &[u8]) -> $crate::Result<Self> {
                    $crate::__private::serde_json::from_slice(bytes)
                        .map_err($crate::error::Error::decoding)
                }
            }
        )+
    };
}

// Scalar tags match the type names used by the other relay clients.
prost_packet!(
    String => "System.String",
    Vec<u8> => "System.Byte[]",
    bool => "System.Boolean",
    i32 => "System.Int32",
    i64 => "System.Int64",
    u32 => "System.UInt32",
    u64 => "System.UInt64",
    f32 => "System.Single",
    f64 => "System.Double",
);

type Decoder<M> = Box<dyn Fn(&[u8]) -> Result<M> + Send + Sync>;

/// Maps packet tags to decoders producing one application-defined type.
///
/// Lets a listener turn every inbound envelope into its own enum in a single lookup
/// instead of probing each packet type in turn.
///
/// ```
/// use global_relay_client::envelope::{Envelope, PacketRegistry};
///
/// enum Inbound {
///     Text(String),
///     Score(i64),
/// }
///
/// let registry = PacketRegistry::new()
///     .register(Inbound::Text)
///     .register(Inbound::Score);
///
/// let bytes = Envelope::broadcast("scores").serialize_with(&42_i64)?;
/// let envelope = Envelope::deserialize(&bytes)?;
///
/// assert!(matches!(registry.decode(&envelope)?, Some(Inbound::Score(42))));
/// # Ok::<(), global_relay_client::error::Error>(())
/// ```
pub struct PacketRegistry<M> {
    decoders: HashMap<&'static str, Decoder<M>>,
}

impl<M: 'static> PacketRegistry<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `P`, wrapping decoded values with `wrap`.
    ///
    /// Registering a second type with the same tag replaces the first.
    #[must_use]
    pub fn register<P: Packet>(mut self, wrap: fn(P) -> M) -> Self {
        let decoder: Decoder<M> = Box::new(move |bytes: &[u8]| P::decode_packet(bytes).map(wrap));
        self.decoders.insert(P::PACKET_TYPE, decoder);
        self
    }

    /// Decode the envelope's packet if its tag is registered.
    ///
    /// Unregistered tags yield `Ok(None)`. A registered tag whose bytes fail to decode is
    /// an error.
    pub fn decode(&self, envelope: &Envelope) -> Result<Option<M>> {
        match self.decoders.get(envelope.packet_type.as_str()) {
            Some(decode) => decode(&envelope.packet_value).map(Some),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn contains(&self, packet_type: &str) -> bool {
        self.decoders.contains_key(packet_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl<M: 'static> Default for PacketRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for PacketRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort_unstable();
        f.debug_struct("PacketRegistry")
            .field("packet_types", &tags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[derive(Debug, PartialEq)]
    enum Inbound {
        Text(String),
        Flag(bool),
    }

    fn registry() -> PacketRegistry<Inbound> {
        PacketRegistry::new()
            .register(Inbound::Text)
            .register(Inbound::Flag)
    }

    fn envelope_for<P: Packet>(packet: &P) -> Envelope {
        let bytes = Envelope::broadcast("chat")
            .serialize_with(packet)
            .expect("scalar packets always encode");
        Envelope::deserialize(&bytes).expect("freshly encoded envelope decodes")
    }

    #[test]
    fn decodes_registered_tag_into_variant() {
        let registry = registry();

        let decoded = registry.decode(&envelope_for(&"hi".to_owned())).unwrap();
        assert_eq!(decoded, Some(Inbound::Text("hi".to_owned())));

        let decoded = registry.decode(&envelope_for(&true)).unwrap();
        assert_eq!(decoded, Some(Inbound::Flag(true)));
    }

    #[test]
    fn unregistered_tag_is_absent() {
        let registry = registry();

        let decoded = registry.decode(&envelope_for(&7_u64)).unwrap();
        assert_eq!(decoded, None);
        assert!(!registry.contains(u64::PACKET_TYPE));
    }

    #[test]
    fn corrupt_bytes_for_registered_tag_is_decoding_error() {
        let registry = registry();
        let mut envelope = envelope_for(&"hi".to_owned());
        envelope.packet_value = vec![0x0A, 0x09, b'x'];

        let error = registry.decode(&envelope).unwrap_err();
        assert_eq!(error.kind(), Kind::Decoding);
    }

    #[test]
    fn debug_lists_sorted_tags() {
        let rendered = format!("{:?}", registry());
        assert_eq!(
            rendered,
            r#"PacketRegistry { packet_types: ["System.Boolean", "System.String"] }"#
        );
        assert_eq!(registry().len(), 2);
    }
}
