//! Error types for rust-keyring

use std::fmt;
use thiserror::Error;

/// Custom `Result` type
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Hex identifier could not be parsed
    InvalidFormat,
    /// No usable record for the index (404-equivalent)
    KeyNotFound,
    /// Protected payload is not `index{sep}ciphertext`
    MalformedPayload,
    /// Cryptographic operation failed
    CryptoFailure,
    /// Storage backend error
    StorageFailure,
    /// Insufficient entropy
    InsufficientEntropy,
    /// Serialization/deserialization failed
    SerializationFailure,
    /// I/O error
    IoFailure,
    /// Sealed key ring could not be opened
    AuthenticationFailure,
    /// Configuration error
    ConfigurationError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat => write!(f, "INVALID_FORMAT"),
            Self::KeyNotFound => write!(f, "KEY_NOT_FOUND"),
            Self::MalformedPayload => write!(f, "MALFORMED_PAYLOAD"),
            Self::CryptoFailure => write!(f, "CRYPTO_FAILURE"),
            Self::StorageFailure => write!(f, "STORAGE_FAILURE"),
            Self::InsufficientEntropy => write!(f, "INSUFFICIENT_ENTROPY"),
            Self::SerializationFailure => write!(f, "SERIALIZATION_FAILURE"),
            Self::IoFailure => write!(f, "IO_FAILURE"),
            Self::AuthenticationFailure => write!(f, "AUTHENTICATION_FAILURE"),
            Self::ConfigurationError => write!(f, "CONFIGURATION_ERROR"),
        }
    }
}

/// `rust-keyring` error type
#[derive(Debug, Error)]
pub enum Error {
    /// Identifier text is not 16 bytes of hex
    #[error("invalid format: {message} (input: {input:?})")]
    InvalidFormat {
        /// The rejected input, truncated for display
        input: String,
        /// What was wrong with it
        message: String,
    },

    /// Index is unknown to the key ring, or its record is corrupt
    #[error("key not found: {index} (operation: {operation})")]
    KeyNotFound {
        /// The index that could not be resolved
        index: String,
        /// The operation that was attempting the lookup
        operation: String,
    },

    /// Protected data does not have the `index{separator}ciphertext` shape
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Why the payload was rejected
        reason: String,
    },

    /// Cryptographic operation failed
    #[error("cryptographic error during {operation}: {message}")]
    CryptoError {
        /// The operation that was being performed when the error occurred
        operation: String,
        /// Detailed error message
        message: String,
        /// Optional record index involved in the operation
        index: Option<String>,
    },

    /// Storage backend failed
    #[error("storage error during {operation}: {message}")]
    StorageError {
        /// The operation that was being performed when the error occurred
        operation: String,
        /// Detailed error message
        message: String,
        /// Optional filesystem path involved in the operation
        path: Option<String>,
    },

    /// Insufficient entropy available
    #[error("insufficient entropy for operation: {operation}")]
    InsufficientEntropy {
        /// The operation that required entropy
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error during {operation}: {message}")]
    SerializationError {
        /// The serialization operation that failed
        operation: String,
        /// Detailed error message
        message: String,
    },

    /// I/O error with context
    #[error("I/O error during {operation}: {source}")]
    IoError {
        /// The I/O operation that failed
        operation: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The sealed key ring did not authenticate under the given sealing key
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// The reason authentication failed
        reason: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem
        message: String,
    },
}

impl Error {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            Self::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            Self::MalformedPayload { .. } => ErrorCode::MalformedPayload,
            Self::CryptoError { .. } => ErrorCode::CryptoFailure,
            Self::StorageError { .. } => ErrorCode::StorageFailure,
            Self::InsufficientEntropy { .. } => ErrorCode::InsufficientEntropy,
            Self::SerializationError { .. } => ErrorCode::SerializationFailure,
            Self::IoError { .. } => ErrorCode::IoFailure,
            Self::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailure,
            Self::ConfigurationError { .. } => ErrorCode::ConfigurationError,
        }
    }

    /// Create a format error, keeping at most 64 characters of the input
    pub fn invalid_format<S: Into<String>>(input: &str, message: S) -> Self {
        Self::InvalidFormat {
            input: input.chars().take(64).collect(),
            message: message.into(),
        }
    }

    /// Create a key-not-found error
    pub fn key_not_found<I: Into<String>, O: Into<String>>(index: I, operation: O) -> Self {
        Self::KeyNotFound {
            index: index.into(),
            operation: operation.into(),
        }
    }

    /// Create a malformed payload error
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Create a crypto error with context
    pub fn crypto<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::CryptoError {
            operation: operation.into(),
            message: message.into(),
            index: None,
        }
    }

    /// Create a crypto error with record context
    pub fn crypto_with_index<O: Into<String>, M: Into<String>, I: Into<String>>(
        operation: O,
        message: M,
        index: I,
    ) -> Self {
        Self::CryptoError {
            operation: operation.into(),
            message: message.into(),
            index: Some(index.into()),
        }
    }

    /// Create a storage error with context
    pub fn storage<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::StorageError {
            operation: operation.into(),
            message: message.into(),
            path: None,
        }
    }

    /// Create a storage error with path context
    pub fn storage_with_path<O: Into<String>, M: Into<String>, P: Into<String>>(
        operation: O,
        message: M,
        path: P,
    ) -> Self {
        Self::StorageError {
            operation: operation.into(),
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::SerializationError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the operation that hit it
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError { .. } | Self::IoError { .. })
    }

    /// Check if the error came from resolving an index
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::key_not_found("abc", "unprotect").code(),
            ErrorCode::KeyNotFound
        );
        assert_eq!(Error::malformed("x").code(), ErrorCode::MalformedPayload);
        assert_eq!(
            Error::invalid_format("zz", "not hex").code(),
            ErrorCode::InvalidFormat
        );
        assert_eq!(ErrorCode::MalformedPayload.to_string(), "MALFORMED_PAYLOAD");
    }

    #[test]
    fn test_invalid_format_truncates_input() {
        let long = "a".repeat(500);
        match Error::invalid_format(&long, "too long") {
            Error::InvalidFormat { input, .. } => assert_eq!(input.len(), 64),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_retryable() {
        let io = Error::io("read", std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(io.is_retryable());
        assert!(!Error::malformed("x").is_retryable());
        assert!(Error::key_not_found("i", "get").is_key_not_found());
    }
}
