/// Error types for the DC-net primitives
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcNetError {
    /// Invalid parameter provided (e.g., room too small, index out of range)
    InvalidParameter(String),
    /// Input validation failed
    ValidationError(String),
    /// Group element or scalar could not be encoded or decoded
    SerializationError(String),
    /// A value does not fit the slot encoding
    EncodingError(String),
}

impl fmt::Display for DcNetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcNetError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            DcNetError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            DcNetError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            DcNetError::EncodingError(msg) => write!(f, "Encoding error: {}", msg),
        }
    }
}

impl std::error::Error for DcNetError {}

impl From<ark_serialize::SerializationError> for DcNetError {
    fn from(err: ark_serialize::SerializationError) -> Self {
        DcNetError::SerializationError(err.to_string())
    }
}
