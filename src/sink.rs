//! Sink engine (`-t`): the peer pushes files and directories to us.
//!
//! Directory nesting is an explicit stack of frames driven by a single
//! read/dispatch loop: `D` pushes, `E` pops, and `E` with an empty stack
//! ends the transfer.

use crate::error::{Result, ScpError};
use crate::guard::OpGuard;
use crate::observer::TransferObserver;
use crate::protocol::{ControlRecord, ScpChannel, Severity, TransferStats, BLOCK_SIZE, MODE_MASK};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, DirBuilder, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Sink configuration
pub struct SinkConfig {
    /// Local path named in the transfer request
    pub destination: PathBuf,
    /// Consecutive unparseable records tolerated inside an open directory
    pub max_desync_records: u32,
}

/// One open directory on the peer's side of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryFrame {
    pub path: PathBuf,
}

pub struct Sink {
    config: SinkConfig,
    observer: Arc<dyn TransferObserver>,
    stats: TransferStats,
}

/// Length of the first content read for a file of `size` bytes. Later reads
/// are full blocks; when `size` is a multiple of the block size the first
/// read is empty.
pub fn first_read_len(size: u64) -> usize {
    (size % BLOCK_SIZE as u64) as usize
}

impl Sink {
    pub fn new(config: SinkConfig, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            config,
            observer,
            stats: TransferStats::new(),
        }
    }

    pub async fn run<R, W>(&mut self, chan: &mut ScpChannel<R, W>) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let guard = chan.guard().clone();

        // Greeting: the peer waits for this before sending its first header.
        chan.write_ack().await?;

        let mut stack: Vec<DirectoryFrame> = Vec::new();
        let mut unknown_run = 0u32;

        loop {
            let record = match chan.read_record().await? {
                Some(record) => record,
                None if stack.is_empty() => break,
                None => {
                    return Err(ScpError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("channel closed with {} directories open", stack.len()),
                    )))
                }
            };
            self.observer.record(&record);

            match record {
                ControlRecord::File { mode, size, name } => {
                    unknown_run = 0;
                    let target = self.resolve(&guard, &stack, &name).await?;
                    self.receive_file(chan, &target, mode, size).await?;
                }
                ControlRecord::Dir { mode, name } => {
                    unknown_run = 0;
                    let path = self.resolve(&guard, &stack, &name).await?;
                    create_dir(&guard, &path, mode).await?;
                    self.stats.directories += 1;
                    self.observer.directory_entered(&path);
                    stack.push(DirectoryFrame { path });
                }
                ControlRecord::End => {
                    unknown_run = 0;
                    match stack.pop() {
                        Some(frame) => self.observer.directory_left(&frame.path),
                        None => break,
                    }
                }
                ControlRecord::Fault { severity, message } => {
                    self.stats.warnings += 1;
                    self.observer.warning(&message);
                    if severity == Severity::Fatal {
                        return Err(ScpError::PeerRejected {
                            code: severity.marker(),
                            message: Some(message),
                        });
                    }
                }
                ControlRecord::Unknown(line) => {
                    self.observer.desync(&line);
                    if stack.is_empty() {
                        break;
                    }
                    unknown_run += 1;
                    if unknown_run >= self.config.max_desync_records {
                        return Err(ScpError::ProtocolDesync(format!(
                            "{} unrecognised control lines in a row, last: {:?}",
                            unknown_run, line
                        )));
                    }
                }
            }
        }

        Ok(self.stats.clone())
    }

    /// Inside a directory the name is joined onto it. At the top level the
    /// destination is used as-is, unless it is an existing directory.
    async fn resolve(
        &self,
        guard: &OpGuard,
        stack: &[DirectoryFrame],
        name: &[u8],
    ) -> Result<PathBuf> {
        let name = name_component(name);
        if let Some(frame) = stack.last() {
            return Ok(frame.path.join(name));
        }

        let dest = &self.config.destination;
        let meta = guard
            .run(
                async {
                    match fs::metadata(dest).await {
                        Ok(meta) => Ok(Some(meta)),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                        Err(e) => Err(e),
                    }
                },
                |e| ScpError::filesystem(dest, e),
            )
            .await?;

        match meta {
            Some(meta) if meta.is_dir() => Ok(dest.join(name)),
            _ => Ok(dest.clone()),
        }
    }

    async fn receive_file<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        path: &Path,
        mode: u32,
        size: u64,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let guard = chan.guard().clone();
        let fs_err = |e| ScpError::filesystem(path, e);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(mode & MODE_MASK);
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = guard.run(options.open(path), fs_err).await?;

        let mut buf = [0u8; BLOCK_SIZE];
        let mut received = 0u64;
        let mut want = first_read_len(size);
        while received < size {
            if want > 0 {
                chan.read_exact(&mut buf[..want]).await?;
                guard.run(file.write_all(&buf[..want]), fs_err).await?;
                received += want as u64;
            }
            want = BLOCK_SIZE;
        }
        guard.run(file.flush(), fs_err).await?;
        drop(file);

        self.stats.bytes += size;

        // The peer's closing status, then ours regardless of what it said.
        let status = chan.read_status().await?;
        chan.write_ack().await?;

        if status.is_ok() {
            self.stats.files += 1;
            self.observer.file_received(path, size);
        } else {
            self.stats.files_rejected += 1;
            self.observer.peer_rejected(
                &format!("closing handshake for {}", path.display()),
                status.code,
                status.message.as_deref(),
            );
        }
        Ok(())
    }
}

/// Header name as a path component, byte for byte where the platform allows.
#[cfg(unix)]
fn name_component(name: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(name))
}

#[cfg(not(unix))]
fn name_component(name: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(name).into_owned())
}

/// Create a directory with `mode`. An existing one is reused untouched.
async fn create_dir(guard: &OpGuard, path: &Path, mode: u32) -> Result<()> {
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    builder.mode(mode & MODE_MASK);
    #[cfg(not(unix))]
    let _ = mode;

    guard
        .run(
            async {
                match builder.create(path).await {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                    other => other,
                }
            },
            |e| ScpError::filesystem(path, e),
        )
        .await
}
