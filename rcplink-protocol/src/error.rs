//! Protocol and catalog error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while encoding commands or parsing wire lines.
///
/// Decoding never surfaces these to callers; the codec logs them and drops
/// the offending line. Encoding returns them so the queue can discard a
/// command that can never be put on the wire.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty line")]
    EmptyLine,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("unknown parameter address: {0}")]
    UnknownAddress(String),

    #[error("missing {0}")]
    MissingToken(&'static str),

    #[error("invalid index '{0}'")]
    InvalidIndex(String),

    #[error("invalid {kind} value '{token}'")]
    InvalidValue { kind: &'static str, token: String },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("value {value} outside domain [{min}, {max}] for {address}")]
    OutOfRange {
        address: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("index {row}:{column} outside bounds for {address}")]
    IndexOutOfBounds {
        address: String,
        row: u32,
        column: u32,
    },

    #[error("{address} is not readable")]
    NotReadable { address: String },

    #[error("{address} is not writable")]
    NotWritable { address: String },

    #[error("set for {0} carries no value")]
    MissingValue(String),

    #[error("{value} cannot be written to a {kind} parameter")]
    TypeMismatch { kind: &'static str, value: String },

    #[error("invalid UTF-8 in line")]
    InvalidUtf8,
}

/// Errors raised while loading or validating a parameter catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog '{0}': {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse catalog: {0}")]
    Parse(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("duplicate address '{0}'")]
    DuplicateAddress(String),

    #[error("scale for '{address}' must be a power of ten, got {scale}")]
    InvalidScale { address: String, scale: u32 },

    #[error("domain for '{address}' is empty: min {min} > max {max}")]
    EmptyDomain { address: String, min: i64, max: i64 },

    #[error("'{0}' must have at least one row and one column")]
    ZeroBounds(String),
}

impl From<serde_yaml::Error> for CatalogError {
    fn from(e: serde_yaml::Error) -> Self {
        CatalogError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownVerb("PING".to_string());
        assert!(err.to_string().contains("PING"));

        let err = ProtocolError::OutOfRange {
            address: "mixer:level".to_string(),
            value: 2000,
            min: -32768,
            max: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000"));
        assert!(msg.contains("mixer:level"));

        let err = ProtocolError::InvalidValue {
            kind: "boolean",
            token: "2".to_string(),
        };
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_catalog_error_display() {
        let err = CatalogError::InvalidScale {
            address: "eq:freq".to_string(),
            scale: 7,
        };
        assert!(err.to_string().contains("power of ten"));

        let err = CatalogError::DuplicateAddress("a:b".to_string());
        assert!(err.to_string().contains("a:b"));
    }
}
