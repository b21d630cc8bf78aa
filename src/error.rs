//! Error types for the Memory Portal Protocol

use thiserror::Error;

/// IPC error types
#[derive(Error, Debug)]
pub enum IpcError {
    /// A named resource is already in use by another owner
    #[error("Shared memory name already in use: {0}")]
    NameInUse(String),

    /// A named resource does not exist
    #[error("Shared memory name not found: {0}")]
    NameNotFound(String),

    /// A resource name failed validation
    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    /// A construction parameter is outside its legal range
    #[error("{what} out of range: {value} (expected {min}..={max})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// The owner has torn the shared region down
    #[error("Channel is shutting down")]
    Shutdown,

    /// The local endpoint was already disposed
    #[error("Channel already disposed")]
    AlreadyDisposed,

    /// A packet header failed to parse
    #[error("Malformed packet frame: {0}")]
    MalformedFrame(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Check if the error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            IpcError::MalformedFrame(_) => true,
            IpcError::Io(err) => {
                matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Convert a POSIX errno from a named-resource operation into an error
    pub(crate) fn from_errno(errno: nix::errno::Errno, name: &str) -> Self {
        match errno {
            nix::errno::Errno::EEXIST => IpcError::NameInUse(name.to_string()),
            nix::errno::Errno::ENOENT => IpcError::NameNotFound(name.to_string()),
            nix::errno::Errno::EACCES => {
                IpcError::Platform(format!("Permission denied: {}", name))
            }
            other => IpcError::Platform(format!("{}: {}", name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery() {
        let frame_error = IpcError::MalformedFrame("bad type".to_string());
        assert!(frame_error.is_recoverable());

        let shutdown = IpcError::Shutdown;
        assert!(!shutdown.is_recoverable());

        let range = IpcError::OutOfRange {
            what: "buffer_capacity",
            value: 128,
            min: 256,
            max: 1_048_576,
        };
        assert!(!range.is_recoverable());
    }

    #[test]
    fn test_errno_mapping() {
        let e = IpcError::from_errno(nix::errno::Errno::EEXIST, "portal_test");
        assert!(matches!(e, IpcError::NameInUse(_)));

        let e = IpcError::from_errno(nix::errno::Errno::ENOENT, "portal_test");
        assert!(matches!(e, IpcError::NameNotFound(_)));
    }
}
