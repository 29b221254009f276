//! Error taxonomy shared by the transport layer and the session orchestrators.

use std::fmt;
use std::io;

/// Which kind of named kernel object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Segment,
    Queue,
    Signal,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment => f.write_str("shared memory segment"),
            Self::Queue => f.write_str("message queue"),
            Self::Signal => f.write_str("signal handler"),
        }
    }
}

/// Coarse error category, used by callers that only care about fatality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or API misuse, detected before touching the kernel.
    Config,
    /// A kernel object could not be created, opened, sized or mapped.
    Resource,
    /// An operation failed against an already open object (or was interrupted).
    Io,
    /// A control token could not be interpreted.
    Protocol,
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to open {object} '{name}': {source}")]
    Resource {
        object: ObjectKind,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{op} on '{name}' failed: {source}")]
    Io {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// A blocking call was interrupted because shutdown was requested.
    #[error("interrupted by shutdown request")]
    Cancelled,

    #[error("malformed control token {token:?}: {reason}")]
    Protocol { token: String, reason: String },
}

impl IpcError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn resource(object: ObjectKind, name: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Resource {
            object,
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn io(op: &'static str, name: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Io {
            op,
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn protocol(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::Io { .. } | Self::Cancelled => ErrorKind::Io,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn cancelled_is_an_io_failure() {
        assert_eq!(IpcError::Cancelled.kind(), ErrorKind::Io);
        assert!(IpcError::Cancelled.is_cancelled());
    }

    #[test]
    fn errno_converts_into_resource_error() {
        let err = IpcError::resource(ObjectKind::Segment, "/seg", Errno::EACCES);
        assert_eq!(err.kind(), ErrorKind::Resource);
        let message = err.to_string();
        assert!(message.starts_with("failed to open shared memory segment '/seg'"));
    }

    #[test]
    fn protocol_error_mentions_token() {
        let err = IpcError::protocol("abc", "not a decimal length");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "malformed control token \"abc\": not a decimal length"
        );
    }
}
