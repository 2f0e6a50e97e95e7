//! Error types shared by every component of the exchange protocol.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Broad classification of a [`ProtocolError`], used by transports to map
/// failures onto status codes without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected input: wrong sizes, empty sequences, unknown ids or categories.
    Validation,
    /// Challenge protocol violation. Always terminal for the challenge.
    Protocol,
    /// Malformed or tampered payload.
    Serialization,
    /// Failure reported by an external key-value collaborator.
    Storage,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid dimension for {field}: {value}")]
    InvalidDimension { field: &'static str, value: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("empty or mismatched sequence: {0}")]
    EmptySequence(String),

    #[error("length mismatch: {0}")]
    LengthMismatch(String),

    #[error("non-finite value in {0}")]
    NonFiniteValue(String),

    #[error("W-matrix not found: {0}")]
    MatrixNotFound(String),

    #[error("challenge not found or already consumed: {0}")]
    ChallengeNotFound(String),

    #[error("challenge expired: {0}")]
    ChallengeExpired(String),

    #[error("nonce mismatch for challenge {0}")]
    NonceMismatch(String),

    #[error("challenge {challenge_id} expects {expected} vectors, got {actual}")]
    CountMismatch {
        challenge_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown anchor category: {0}")]
    UnknownCategory(String),

    #[error("unknown anchor id: {0}")]
    UnknownAnchor(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::InvalidDimension { .. }
            | ProtocolError::DimensionMismatch { .. }
            | ProtocolError::EmptySequence(_)
            | ProtocolError::LengthMismatch(_)
            | ProtocolError::NonFiniteValue(_)
            | ProtocolError::MatrixNotFound(_)
            | ProtocolError::UnknownCategory(_)
            | ProtocolError::UnknownAnchor(_)
            | ProtocolError::InvalidConfig(_) => ErrorKind::Validation,
            ProtocolError::ChallengeNotFound(_)
            | ProtocolError::ChallengeExpired(_)
            | ProtocolError::NonceMismatch(_)
            | ProtocolError::CountMismatch { .. } => ErrorKind::Protocol,
            ProtocolError::Serialization(_) | ProtocolError::Crypto(_) => {
                ErrorKind::Serialization
            }
            ProtocolError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable machine-readable name of the variant.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidDimension { .. } => "InvalidDimension",
            ProtocolError::DimensionMismatch { .. } => "DimensionMismatch",
            ProtocolError::EmptySequence(_) => "EmptySequence",
            ProtocolError::LengthMismatch(_) => "LengthMismatch",
            ProtocolError::NonFiniteValue(_) => "NonFiniteValue",
            ProtocolError::MatrixNotFound(_) => "MatrixNotFound",
            ProtocolError::ChallengeNotFound(_) => "ChallengeNotFound",
            ProtocolError::ChallengeExpired(_) => "ChallengeExpired",
            ProtocolError::NonceMismatch(_) => "NonceMismatch",
            ProtocolError::CountMismatch { .. } => "CountMismatch",
            ProtocolError::UnknownCategory(_) => "UnknownCategory",
            ProtocolError::UnknownAnchor(_) => "UnknownAnchor",
            ProtocolError::InvalidConfig(_) => "InvalidConfig",
            ProtocolError::Serialization(_) => "SerializationError",
            ProtocolError::Crypto(_) => "CryptoError",
            ProtocolError::Storage(_) => "StorageError",
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        ProtocolError::Serialization(msg.into())
    }

    pub fn mismatch(expected: usize, actual: usize) -> Self {
        ProtocolError::DimensionMismatch { expected, actual }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        ProtocolError::Serialization(format!("invalid base64: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ProtocolError::mismatch(3, 4).kind(), ErrorKind::Validation);
        assert_eq!(
            ProtocolError::ChallengeExpired("c1".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            ProtocolError::serialization("bad").kind(),
            ErrorKind::Serialization
        );
    }

    #[test]
    fn test_error_display_carries_ids() {
        let err = ProtocolError::CountMismatch {
            challenge_id: "abc".into(),
            expected: 10,
            actual: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("10"));
        assert_eq!(err.code(), "CountMismatch");
    }
}
