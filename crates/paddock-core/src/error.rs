//! Error type shared by every fallible core operation.
//!
//! Errors carry a kind, a human-readable message and, for syscall failures,
//! the raw errno. The triple travels verbatim to clients; nothing in the
//! daemon maps one kind onto another on the way out.

use nix::errno::Errno;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure; `errno` holds the raw code when one exists.
    Unknown,
    /// A property value or argument failed validation.
    InvalidValue,
    /// No property with the requested name.
    InvalidProperty,
    /// No data item with the requested name.
    InvalidData,
    /// Operation not permitted in the container's current state.
    InvalidState,
    /// Feature unavailable (kernel knob missing, network disabled).
    NotSupported,
    /// Caller lacks privilege for this property or container.
    Permission,
    /// Host cannot satisfy the request.
    ResourceNotAvailable,
    /// Container lookup failed.
    ContainerDoesNotExist,
    /// A container with this name already exists.
    ContainerAlreadyExists,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidProperty => "InvalidProperty",
            Self::InvalidData => "InvalidData",
            Self::InvalidState => "InvalidState",
            Self::NotSupported => "NotSupported",
            Self::Permission => "Permission",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
        };
        f.write_str(name)
    }
}

/// Error returned by core operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description, surfaced to clients verbatim.
    pub message: String,
    /// Raw errno for syscall failures.
    pub errno: Option<i32>,
}

impl Error {
    /// Create an error without an errno.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    /// Create an error carrying a raw errno.
    pub fn with_errno(kind: ErrorKind, errno: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: Some(errno),
        }
    }

    /// Shorthand for an `InvalidValue` error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    /// Shorthand for an `InvalidState` error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// Shorthand for a `NotSupported` error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    /// Shorthand for a `Permission` error.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    /// Shorthand for an `Unknown` error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// The raw errno, or 0 when none was recorded.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.errno.unwrap_or(0)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: errno.desc().to_string(),
            errno: Some(errno as i32),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::unknown(format!("record decode error: {err}"))
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::invalid_value("bad rate");
        assert_eq!(err.to_string(), "InvalidValue: bad rate");
    }

    #[test]
    fn test_io_error_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = Error::from(io);
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_errno_defaults_to_zero() {
        assert_eq!(Error::invalid_state("stopped").errno(), 0);
    }
}
