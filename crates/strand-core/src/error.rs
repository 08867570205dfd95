//! Error types for strand-core

use thiserror::Error;

/// Errors raised while encoding or decoding core types
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// A record body could not be deserialized
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stream metadata JSON was malformed
    #[error("Invalid stream metadata: {0}")]
    InvalidMetadata(String),
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        CoreError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidMetadata(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postcard_error_maps_to_decode() {
        let err = postcard::from_bytes::<u64>(&[]).unwrap_err();
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::Decode(_)));
    }

    #[test]
    fn test_json_error_maps_to_metadata() {
        let err = serde_json::from_str::<u64>("not json").unwrap_err();
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::InvalidMetadata(_)));
        assert!(core.to_string().starts_with("Invalid stream metadata"));
    }
}
