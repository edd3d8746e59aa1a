use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to invalid input supplied by the caller
    Validation,
    /// The identity token could not be read or created
    Identity,
    /// A packet or envelope could not be encoded
    Encoding,
    /// Inbound bytes could not be decoded into an envelope or packet
    Decoding,
    /// Error related to the WebSocket transport
    WebSocket,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn identity<S: StdError + Send + Sync + 'static>(source: S) -> Self {
        Self::with_source(Kind::Identity, source)
    }

    pub fn encoding<S: StdError + Send + Sync + 'static>(source: S) -> Self {
        Self::with_source(Kind::Encoding, source)
    }

    pub fn decoding<S: StdError + Send + Sync + 'static>(source: S) -> Self {
        Self::with_source(Kind::Decoding, source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::with_source(Kind::Encoding, e)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::with_source(Kind::Decoding, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_should_succeed() {
        let error = Error::validation("module must not contain whitespace");

        assert_eq!(error.kind(), Kind::Validation);
        assert_eq!(
            error.to_string(),
            "Validation: invalid: module must not contain whitespace"
        );
    }

    #[test]
    fn decode_error_maps_to_decoding_kind() {
        // Field 1, length-delimited, claims five bytes but carries none
        let truncated = <String as prost::Message>::decode(&[0x0A_u8, 0x05][..])
            .expect_err("truncated input must not decode");
        let error: Error = truncated.into();

        assert_eq!(error.kind(), Kind::Decoding);
        assert!(error.downcast_ref::<prost::DecodeError>().is_some());
    }

    #[test]
    fn io_error_maps_to_internal_kind() {
        let error: Error = std::io::Error::other("disk full").into();

        assert_eq!(error.kind(), Kind::Internal);
        assert!(error.to_string().contains("disk full"));
    }
}
