//! Buffered protocol channel.
//!
//! All reads (control lines, status bytes, file content) go through one
//! `BufReader`, so bytes that arrive right behind a control line are never
//! lost between units.

use crate::error::{Result, ScpError};
use crate::guard::OpGuard;
use crate::protocol::ack::{self, AckStatus, ACK_OK};
use crate::protocol::record::ControlRecord;
use std::io;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Transfer buffer size for file content
pub const BLOCK_SIZE: usize = 1024;

/// Longest control line accepted (header plus a PATH_MAX-sized name)
pub const MAX_LINE_LEN: usize = 8 * 1024;

pub struct ScpChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    guard: OpGuard,
}

impl<R, W> ScpChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, guard: OpGuard) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            guard,
        }
    }

    pub fn guard(&self) -> &OpGuard {
        &self.guard
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader.into_inner(), self.writer)
    }

    // =========================================================================
    // Status bytes
    // =========================================================================

    pub async fn read_ack(&mut self) -> Result<u8> {
        self.guard.io(ack::read_ack(&mut self.reader)).await
    }

    /// Read a status byte and, for warning/fatal codes, the message after it.
    pub async fn read_status(&mut self) -> Result<AckStatus> {
        let code = self.read_ack().await?;
        if code == ACK_OK {
            return Ok(AckStatus::ok());
        }
        let message = if AckStatus::carries_message(code) {
            self.read_line().await?.map(|line| {
                let line = line.strip_suffix(b"\n").unwrap_or(&line);
                String::from_utf8_lossy(line).into_owned()
            })
        } else {
            None
        };
        Ok(AckStatus { code, message })
    }

    pub async fn write_ack(&mut self) -> Result<()> {
        self.guard.io(ack::write_ack(&mut self.writer)).await
    }

    // =========================================================================
    // Control lines
    // =========================================================================

    /// Read up to and including the next `\n`. `None` means the peer closed
    /// the channel cleanly at a line boundary.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LEN as u64);
        let n = self.guard.io(limited.read_until(b'\n', &mut line)).await?;

        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if n >= MAX_LINE_LEN {
                return Err(ScpError::ProtocolDesync(format!(
                    "control line longer than {} bytes",
                    MAX_LINE_LEN
                )));
            }
            return Err(ScpError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed in the middle of a control line",
            )));
        }
        Ok(Some(line))
    }

    /// Read and parse the next control line, acknowledging it on receipt.
    /// Error records are returned without an acknowledgement.
    pub async fn read_record(&mut self) -> Result<Option<ControlRecord>> {
        let Some(line) = self.read_line().await? else {
            return Ok(None);
        };
        let record = ControlRecord::parse(&line);
        if !record.is_fault() {
            self.write_ack().await?;
        }
        Ok(Some(record))
    }

    pub async fn write_record(&mut self, record: &ControlRecord) -> Result<()> {
        let encoded = record.encode();
        self.guard.io(self.writer.write_all(&encoded)).await?;
        self.flush().await
    }

    /// Write a control line and wait for the peer's status byte.
    pub async fn send_record(&mut self, record: &ControlRecord) -> Result<AckStatus> {
        self.write_record(record).await?;
        self.read_status().await
    }

    // =========================================================================
    // Raw content
    // =========================================================================

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.guard.io(self.reader.read_exact(buf)).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.guard.io(self.writer.write_all(buf)).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.guard.io(self.writer.flush()).await
    }

    /// Close the write half. Errors are ignored: the peer may already be gone.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("channel shutdown: {}", e);
        }
    }
}

// =============================================================================
// Transfer statistics
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Files fully transferred and acknowledged
    pub files: u64,

    /// Directories created or sent
    pub directories: u64,

    /// Content bytes moved over the channel
    pub bytes: u64,

    /// Files whose closing handshake carried a nonzero status
    pub files_rejected: u64,

    /// Error records sent or received
    pub warnings: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn channel_over(input: &'static [u8]) -> ScpChannel<&'static [u8], Vec<u8>> {
        ScpChannel::new(input, Vec::new(), OpGuard::default())
    }

    #[tokio::test]
    async fn test_record_is_acked_on_receipt() {
        let mut chan = channel_over(b"C0644 3 abc\nxyz");
        let record = chan.read_record().await.unwrap().unwrap();
        assert_eq!(record, ControlRecord::file(0o644, 3, "abc"));
        assert_eq!(chan.writer, vec![0u8]);

        // Content right behind the header is still buffered.
        let mut content = [0u8; 3];
        chan.read_exact(&mut content).await.unwrap();
        assert_eq!(&content, b"xyz");
    }

    #[tokio::test]
    async fn test_fault_is_not_acked() {
        let mut chan = channel_over(b"\x01scp: nope\n");
        let record = chan.read_record().await.unwrap().unwrap();
        assert!(record.is_fault());
        assert!(chan.writer.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_and_truncated_line() {
        let mut chan = channel_over(b"");
        assert!(chan.read_record().await.unwrap().is_none());

        let mut chan = channel_over(b"C0644 3 ab");
        let err = chan.read_line().await.unwrap_err();
        assert!(matches!(err, ScpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_overlong_line_is_desync() {
        let long: &'static [u8] = Box::leak(vec![b'C'; MAX_LINE_LEN + 10].into_boxed_slice());
        let mut chan = channel_over(long);
        let err = chan.read_line().await.unwrap_err();
        assert!(matches!(err, ScpError::ProtocolDesync(_)));
    }

    #[tokio::test]
    async fn test_status_with_message() {
        let mut chan = channel_over(b"\x00\x01scp: disk full\n\x05");
        assert!(chan.read_status().await.unwrap().is_ok());

        let warning = chan.read_status().await.unwrap();
        assert_eq!(warning.code, 1);
        assert_eq!(warning.message.as_deref(), Some("scp: disk full"));

        let odd = chan.read_status().await.unwrap();
        assert_eq!(odd, AckStatus { code: 5, message: None });
    }

    #[tokio::test]
    async fn test_send_record_waits_for_status() {
        let (ours, theirs) = duplex(64);
        let (our_r, our_w) = tokio::io::split(ours);
        let (mut their_r, mut their_w) = tokio::io::split(theirs);
        let mut chan = ScpChannel::new(our_r, our_w, OpGuard::default());

        let peer = tokio::spawn(async move {
            let mut line = vec![0u8; 10];
            their_r.read_exact(&mut line).await.unwrap();
            their_w.write_all(&[0]).await.unwrap();
            line
        });

        let status = chan
            .send_record(&ControlRecord::dir(0o755, "a"))
            .await
            .unwrap();
        assert!(status.is_ok());
        assert_eq!(peer.await.unwrap(), b"D0755 0 a\n".to_vec());
    }
}
