//! Single-byte status exchange.
//!
//! Writing only ever produces the success byte. Failures travel as error
//! records instead (see [`crate::protocol::record`]).

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ACK_OK: u8 = 0x00;
/// Non-fatal failure; a message line follows.
pub const ACK_WARNING: u8 = 0x01;
/// Fatal failure; a message line follows.
pub const ACK_FATAL: u8 = 0x02;

/// Status byte read from the peer, plus the message line that accompanies
/// the warning and fatal codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckStatus {
    pub code: u8,
    pub message: Option<String>,
}

impl AckStatus {
    pub fn ok() -> Self {
        Self {
            code: ACK_OK,
            message: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ACK_OK
    }

    /// Codes that are followed by a newline-terminated message on the wire.
    pub fn carries_message(code: u8) -> bool {
        matches!(code, ACK_WARNING | ACK_FATAL)
    }
}

/// Block until exactly one byte arrives. EOF is an error.
pub async fn read_ack<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u8> {
    r.read_u8().await
}

pub async fn write_ack<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    w.write_all(&[ACK_OK]).await?;
    w.flush().await
}
