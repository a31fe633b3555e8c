//! Error taxonomy shared by the codec, the connection layer and the broker.
//!
//! Remote failures travel over the wire as a one-byte exception code plus a
//! short message and a detail string. [`RemoteErrorKind`] is the closed set of
//! those codes; [`SbwError::Remote`] carries one back to the caller that issued
//! the call so it can branch on the kind.

use thiserror::Error;

/// Exception code carried in an exception frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RemoteErrorKind {
    Application = 0,
    Raw = 1,
    Communication = 2,
    ModuleStart = 3,
    TypeMismatch = 4,
    IncompatibleMethodSignature = 5,
    ModuleIdSyntax = 6,
    IncorrectCategorySyntax = 7,
    ServiceNotFound = 8,
    MethodTypeNotBlockType = 9,
    MethodAmbiguous = 10,
    UnsupportedObjectType = 11,
    MethodNotFound = 12,
    SignatureSyntax = 13,
    ModuleDefinition = 14,
    ModuleNotFound = 15,
    BrokerStart = 16,
}

impl RemoteErrorKind {
    // ---

    /// Decode a wire exception code. Unknown codes fall back to `Application`.
    pub fn from_code(code: u8) -> Self {
        // ---
        match code {
            1 => Self::Raw,
            2 => Self::Communication,
            3 => Self::ModuleStart,
            4 => Self::TypeMismatch,
            5 => Self::IncompatibleMethodSignature,
            6 => Self::ModuleIdSyntax,
            7 => Self::IncorrectCategorySyntax,
            8 => Self::ServiceNotFound,
            9 => Self::MethodTypeNotBlockType,
            10 => Self::MethodAmbiguous,
            11 => Self::UnsupportedObjectType,
            12 => Self::MethodNotFound,
            13 => Self::SignatureSyntax,
            14 => Self::ModuleDefinition,
            15 => Self::ModuleNotFound,
            16 => Self::BrokerStart,
            _ => Self::Application,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        let name = match self {
            Self::Application => "application error",
            Self::Raw => "raw error",
            Self::Communication => "communication error",
            Self::ModuleStart => "module start error",
            Self::TypeMismatch => "type mismatch",
            Self::IncompatibleMethodSignature => "incompatible method signature",
            Self::ModuleIdSyntax => "module id syntax error",
            Self::IncorrectCategorySyntax => "incorrect category syntax",
            Self::ServiceNotFound => "service not found",
            Self::MethodTypeNotBlockType => "method type not block type",
            Self::MethodAmbiguous => "method ambiguous",
            Self::UnsupportedObjectType => "unsupported object type",
            Self::MethodNotFound => "method not found",
            Self::SignatureSyntax => "signature syntax error",
            Self::ModuleDefinition => "module definition error",
            Self::ModuleNotFound => "module not found",
            Self::BrokerStart => "broker start error",
        };
        f.write_str(name)
    }
}

/// Errors raised by the codec, connections, the broker and bootstrap.
#[derive(Error, Debug)]
pub enum SbwError {
    /// Socket-level failure, disconnect, or a peer that broke the protocol.
    #[error("{message}")]
    Communication { message: String, detail: String },

    /// A read ran past the end of a data block.
    #[error("reached end of data when expecting {expected}{context}")]
    EndOfData {
        expected: &'static str,
        context: String,
    },

    /// The tag in the data block is not the one the caller asked for.
    #[error("encountered {actual} required {expected}{context}")]
    TypeMismatch {
        actual: &'static str,
        expected: &'static str,
        context: String,
    },

    /// Structurally invalid data (negative lengths, unknown tags, bad UTF-8).
    #[error("malformed data block: {0}")]
    Malformed(String),

    /// Exception raised by the remote side of a call.
    #[error("{kind}: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
        detail: String,
    },

    /// Session key missing, empty or unreadable.
    #[error("session key error: {0}")]
    SessionKey(String),

    /// Invalid configuration value (port ranges, patterns, paths).
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker process could not be located or started.
    #[error("{message}")]
    BrokerStart { message: String, detail: String },

    /// A resource is not ready yet; the only class retried by backoff helpers.
    #[error("not available: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SbwError {
    // ---

    pub fn communication(message: impl Into<String>) -> Self {
        // ---
        Self::Communication {
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn communication_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        // ---
        Self::Communication {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        // ---
        Self::Remote {
            kind,
            message: message.into(),
            detail: String::new(),
        }
    }

    /// Exception code used when this error is reported back over the wire.
    pub fn kind(&self) -> RemoteErrorKind {
        // ---
        match self {
            Self::Communication { .. } | Self::Io(_) | Self::Unavailable(_) => {
                RemoteErrorKind::Communication
            }
            Self::EndOfData { .. } | Self::Malformed(_) => RemoteErrorKind::Raw,
            Self::TypeMismatch { .. } => RemoteErrorKind::TypeMismatch,
            Self::Remote { kind, .. } => *kind,
            Self::BrokerStart { .. } => RemoteErrorKind::BrokerStart,
            Self::SessionKey(_) | Self::Config(_) => RemoteErrorKind::Application,
        }
    }

    /// Short, user-facing message.
    pub fn message(&self) -> String {
        // ---
        match self {
            Self::Communication { message, .. }
            | Self::Remote { message, .. }
            | Self::BrokerStart { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Longer diagnostic text; empty when none was recorded.
    pub fn detail(&self) -> String {
        // ---
        match self {
            Self::Communication { detail, .. }
            | Self::Remote { detail, .. }
            | Self::BrokerStart { detail, .. } => detail.clone(),
            Self::Io(err) => err.to_string(),
            _ => String::new(),
        }
    }

    /// Whether a bounded retry loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Result type alias for broker and module operations
pub type Result<T> = std::result::Result<T, SbwError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        // ---
        for code in 0..=16u8 {
            assert_eq!(RemoteErrorKind::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_application() {
        // ---
        assert_eq!(RemoteErrorKind::from_code(42), RemoteErrorKind::Application);
        assert_eq!(RemoteErrorKind::from_code(255), RemoteErrorKind::Application);
    }

    #[test]
    fn test_type_mismatch_message_names_both_tags() {
        // ---
        let err = SbwError::TypeMismatch {
            actual: "string",
            expected: "integer",
            context: " in module id".into(),
        };
        assert_eq!(err.to_string(), "encountered string required integer in module id");
        assert_eq!(err.kind(), RemoteErrorKind::TypeMismatch);
    }

    #[test]
    fn test_only_unavailable_and_io_retry() {
        // ---
        assert!(SbwError::Unavailable("port".into()).is_retryable());
        assert!(SbwError::Io(std::io::ErrorKind::ConnectionRefused.into()).is_retryable());
        assert!(!SbwError::communication("rejected").is_retryable());
        assert!(!SbwError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_remote_keeps_message_and_detail() {
        // ---
        let err = SbwError::Remote {
            kind: RemoteErrorKind::MethodNotFound,
            message: "no such method".into(),
            detail: "method 9 on service 2".into(),
        };
        assert_eq!(err.message(), "no such method");
        assert_eq!(err.detail(), "method 9 on service 2");
        assert_eq!(err.to_string(), "method not found: no such method");
    }
}
