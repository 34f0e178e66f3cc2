use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// Use of Internal is never a guarantee the error is not caused by the
    /// caller, merely that it cannot be confidently determined by the code.
    Internal,

    /// The caller provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A KDF recovery buffer is shorter than `param_size + salt_size`, or
    /// its cost block is not something the primitive accepts.
    InvalidParameterSize,
    /// The memory/time budgets cannot accommodate any valid parameter
    /// choice. Retrying with looser budgets may succeed.
    ResourceExceeded,
    /// A read/write/finish was issued on a finalized session.
    SessionClosed,
    /// The operation is intentionally unsupported.
    NotImplemented,
    /// Scratch storage for a session could not be created or committed.
    Staging,
    /// A session offset moved backwards; the keystream cannot rewind.
    OffsetRegression,
    /// A read was issued on a write session or vice versa.
    WrongDirection,
    /// Key material does not have a length the cipher accepts.
    InvalidKeyLength,
    /// A plugin configuration value is missing or malformed.
    InvalidConfig,
    /// A sealed container is truncated or has a malformed header.
    ContainerFormat,
    /// Authentication failed due to an incorrect passphrase or tampering
    /// or corruption.
    AuthenticationFailed,
    /// The armored representation is malformed (prefix or encoding).
    ArmoringInvalid,
    /// Base64 decoding of the armored payload failed.
    ArmoringDecode,
    /// Input claimed to be armored by us but used a future/unsupported version.
    ArmoringFromFuture,
    /// Passphrase could not be read from stdin or the terminal.
    PassphraseUnavailable,
    /// Low-level scrypt key derivation failed.
    ScryptFailure,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
    /// Unexpected state reached within our own logic.
    InternalInvariant,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CryptError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl CryptError {
    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for I/O failures, which are internal unless the path is missing.
    pub fn io(msg: impl Into<String>, err: std::io::Error) -> Self {
        let category = if err.kind() == std::io::ErrorKind::NotFound {
            ErrorCategory::User
        } else {
            ErrorCategory::Internal
        };
        Self::with_kind_and_source(category, ErrorKind::Io, msg, err)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// True if this error was tagged with `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == Some(kind)
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, CryptError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_context_preserves_kind() {
        let err = CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::SessionClosed,
            "session already finished",
        )
        .with_context("failed to read chunk");

        assert!(err.is(ErrorKind::SessionClosed));
        assert_eq!(err.category, ErrorCategory::User);
        assert_eq!(err.message(), "failed to read chunk");
        assert!(err.source_error().is_some());
    }

    #[test]
    fn test_io_not_found_is_user_error() {
        let err = CryptError::io("missing", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.category, ErrorCategory::User);
        assert!(err.is(ErrorKind::Io));

        let err = CryptError::io("denied", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.category, ErrorCategory::Internal);
    }
}
