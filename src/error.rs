//! Error types for the SCP responder.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScpError {
    /// A control line did not match the `C`/`D`/`E` grammar, or too many
    /// unparseable lines arrived in a row.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Channel I/O failed: {0}")]
    Transport(#[source] io::Error),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer answered a handshake with a nonzero status byte.
    #[error("Peer rejected transfer (status {code}){}", fmt_message(.message))]
    PeerRejected { code: u8, message: Option<String> },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_message(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl ScpError {
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ScpError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether the channel can no longer carry protocol traffic after this
    /// error. Non-fatal errors leave the byte stream at a unit boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScpError::Transport(_)
                | ScpError::Cancelled
                | ScpError::TimedOut(_)
                | ScpError::ProtocolDesync(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_rejected_display() {
        let err = ScpError::PeerRejected {
            code: 1,
            message: Some("scp: disk full".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Peer rejected transfer (status 1): scp: disk full"
        );

        let bare = ScpError::PeerRejected {
            code: 7,
            message: None,
        };
        assert_eq!(bare.to_string(), "Peer rejected transfer (status 7)");
    }

    #[test]
    fn test_fatality() {
        let eof = ScpError::Transport(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_fatal());
        assert!(ScpError::Cancelled.is_fatal());

        let fs = ScpError::filesystem("/tmp/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(!fs.is_fatal());
        assert!(!ScpError::PeerRejected {
            code: 1,
            message: None
        }
        .is_fatal());
    }
}
