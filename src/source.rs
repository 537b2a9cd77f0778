//! Source engine (`-f`): the peer pulls files and directories from us.
//!
//! Directories are walked depth-first with an explicit stack of pending
//! listings. Every header waits for the peer's status byte before the next
//! unit goes out.

use crate::config::ListingOrder;
use crate::error::{Result, ScpError};
use crate::guard::OpGuard;
use crate::observer::TransferObserver;
use crate::protocol::{
    is_valid_name, ControlRecord, ScpChannel, TransferStats, BLOCK_SIZE, MODE_MASK,
};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Source configuration
pub struct SourceConfig {
    /// Local file or directory to send
    pub path: PathBuf,
    pub listing_order: ListingOrder,
}

/// A directory whose header has been acknowledged and whose entries are
/// still being sent.
struct PendingDir {
    path: PathBuf,
    entries: std::vec::IntoIter<PathBuf>,
}

pub struct Source {
    config: SourceConfig,
    observer: Arc<dyn TransferObserver>,
    stats: TransferStats,
}

impl Source {
    pub fn new(config: SourceConfig, observer: Arc<dyn TransferObserver>) -> Self {
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

        let ready = chan.read_status().await?;
        if !ready.is_ok() {
            return Err(ScpError::PeerRejected {
                code: ready.code,
                message: ready.message,
            });
        }

        let path = self.config.path.clone();
        let outcome = match stat(&guard, &path).await {
            Ok(meta) if meta.is_dir() => self.send_tree(chan, &path, &meta).await,
            Ok(meta) if meta.is_file() => self.send_file(chan, &path).await,
            Ok(_) => {
                self.send_warning(chan, format!("scp: {}: not a regular file", path.display()))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => self.send_warning(chan, format!("scp: {}", e)).await?,
        }

        let closing = chan.send_record(&ControlRecord::End).await?;
        if !closing.is_ok() {
            self.observer
                .peer_rejected("final end", closing.code, closing.message.as_deref());
        }

        Ok(self.stats.clone())
    }

    // =========================================================================
    // Directories
    // =========================================================================

    async fn send_tree<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        root: &Path,
        meta: &Metadata,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stack = Vec::new();
        let root_name = base_name(chan.guard(), root).await?;
        self.open_directory(chan, root, root_name, meta, &mut stack)
            .await?;

        let walked = self.walk(chan, &mut stack).await;
        if let Err(e) = walked {
            // Close whatever the peer still has open so the channel stays usable.
            if !e.is_fatal() {
                while let Some(dir) = stack.pop() {
                    self.close_directory(chan, &dir.path).await?;
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn walk<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        stack: &mut Vec<PendingDir>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let guard = chan.guard().clone();

        while let Some(top) = stack.last_mut() {
            let Some(entry) = top.entries.next() else {
                if let Some(done) = stack.pop() {
                    self.close_directory(chan, &done.path).await?;
                }
                continue;
            };

            let meta = match entry_metadata(&guard, &entry).await {
                Ok(meta) => meta,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.send_warning(chan, format!("scp: {}", e)).await?;
                    continue;
                }
            };

            match meta {
                EntryKind::File => self.send_file(chan, &entry).await?,
                EntryKind::Dir(meta) => {
                    let name = file_name(&entry);
                    self.open_directory(chan, &entry, name, &meta, stack).await?;
                }
                EntryKind::Skip(reason) => {
                    self.send_warning(chan, format!("scp: {}: {}", entry.display(), reason))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// List the directory, then send its header. A listing failure is
    /// reported and the directory skipped; a rejected header aborts.
    async fn open_directory<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        path: &Path,
        name: Vec<u8>,
        meta: &Metadata,
        stack: &mut Vec<PendingDir>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !is_valid_name(&name) {
            return self.reject_name(chan, path).await;
        }

        let guard = chan.guard().clone();
        let entries = match list_entries(&guard, path, self.config.listing_order).await {
            Ok(entries) => entries,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.send_warning(chan, format!("scp: {}", e)).await,
        };

        let status = chan
            .send_record(&ControlRecord::dir(mode_bits(meta), name))
            .await?;
        if !status.is_ok() {
            return Err(ScpError::PeerRejected {
                code: status.code,
                message: status.message,
            });
        }

        self.stats.directories += 1;
        self.observer.directory_entered(path);
        stack.push(PendingDir {
            path: path.to_path_buf(),
            entries: entries.into_iter(),
        });
        Ok(())
    }

    async fn close_directory<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        path: &Path,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let status = chan.send_record(&ControlRecord::End).await?;
        if !status.is_ok() {
            self.observer.peer_rejected(
                &format!("end of {}", path.display()),
                status.code,
                status.message.as_deref(),
            );
        }
        self.observer.directory_left(path);
        Ok(())
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Send one regular file. A file that cannot be opened, or whose name
    /// cannot go on the wire, is reported and skipped; a rejected header
    /// aborts.
    async fn send_file<R, W>(&mut self, chan: &mut ScpChannel<R, W>, path: &Path) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let name = file_name(path);
        if !is_valid_name(&name) {
            return self.reject_name(chan, path).await;
        }

        let guard = chan.guard().clone();
        let fs_err = |e| ScpError::filesystem(path, e);

        let opened = async {
            let file = guard.run(File::open(path), fs_err).await?;
            let meta = guard.run(file.metadata(), fs_err).await?;
            Ok::<_, ScpError>((file, meta))
        }
        .await;
        let (file, meta) = match opened {
            Ok(opened) => opened,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.send_warning(chan, format!("scp: {}", e)).await,
        };

        self.send_opened(chan, path, name, file, &meta).await
    }

    /// Header, content and closing handshake for a file already open.
    async fn send_opened<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        path: &Path,
        name: Vec<u8>,
        file: File,
        meta: &Metadata,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let guard = chan.guard().clone();
        let size = meta.len();
        let header = ControlRecord::file(mode_bits(meta), size, name);
        let status = chan.send_record(&header).await?;
        if !status.is_ok() {
            return Err(ScpError::PeerRejected {
                code: status.code,
                message: status.message,
            });
        }

        let mut sent = 0u64;
        let streamed = stream_content(chan, &guard, file, path, size, &mut sent).await;
        self.stats.bytes += sent;

        // Exactly `size` bytes must go out before the closing handshake. If
        // reading failed, pad and send an error record in place of our ack.
        let failure = match streamed {
            Ok(()) => {
                chan.write_ack().await?;
                None
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                pad_content(chan, size - sent).await?;
                chan.write_record(&ControlRecord::warning(format!("scp: {}", e)))
                    .await?;
                Some(e)
            }
        };

        let closing = chan.read_status().await?;
        if let Some(e) = failure {
            self.stats.warnings += 1;
            self.stats.files_rejected += 1;
            self.observer.warning(&e.to_string());
        } else if !closing.is_ok() {
            self.stats.files_rejected += 1;
            self.observer.peer_rejected(
                &format!("closing handshake for {}", path.display()),
                closing.code,
                closing.message.as_deref(),
            );
        } else {
            self.stats.files += 1;
            self.observer.file_sent(path, size);
        }
        Ok(())
    }

    async fn reject_name<R, W>(&mut self, chan: &mut ScpChannel<R, W>, path: &Path) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.send_warning(chan, format!("scp: {}: unexpected filename", path.display()))
            .await
    }

    /// Report an item that cannot be produced. The record is not acked.
    async fn send_warning<R, W>(
        &mut self,
        chan: &mut ScpChannel<R, W>,
        message: String,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.stats.warnings += 1;
        self.observer.warning(&message);
        chan.write_record(&ControlRecord::warning(message)).await
    }
}

/// Stream at most `size` bytes of `file` in blocks. A block shorter than
/// `BLOCK_SIZE` is the last one.
async fn stream_content<R, W>(
    chan: &mut ScpChannel<R, W>,
    guard: &OpGuard,
    file: File,
    path: &Path,
    size: u64,
    sent: &mut u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = file.take(size);
    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let n = fill_block(guard, &mut reader, &mut buf, path).await?;
        chan.write_all(&buf[..n]).await?;
        *sent += n as u64;
        if n < BLOCK_SIZE {
            break;
        }
    }
    chan.flush().await?;

    if *sent < size {
        return Err(ScpError::filesystem(
            path,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank to {} of {} bytes while sending", sent, size),
            ),
        ));
    }
    Ok(())
}

async fn fill_block<T: AsyncRead + Unpin>(
    guard: &OpGuard,
    reader: &mut T,
    buf: &mut [u8],
    path: &Path,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = guard
            .run(reader.read(&mut buf[filled..]), |e| {
                ScpError::filesystem(path, e)
            })
            .await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn pad_content<R, W>(chan: &mut ScpChannel<R, W>, mut remaining: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let zeros = [0u8; BLOCK_SIZE];
    while remaining > 0 {
        let n = remaining.min(BLOCK_SIZE as u64) as usize;
        chan.write_all(&zeros[..n]).await?;
        remaining -= n as u64;
    }
    chan.flush().await
}

// =============================================================================
// Filesystem helpers
// =============================================================================

enum EntryKind {
    File,
    Dir(Metadata),
    Skip(&'static str),
}

async fn stat(guard: &OpGuard, path: &Path) -> Result<Metadata> {
    guard
        .run(fs::metadata(path), |e| ScpError::filesystem(path, e))
        .await
}

/// Classify a directory entry. Symlinks to files are followed; symlinks to
/// directories are skipped so cycles cannot recurse forever.
async fn entry_metadata(guard: &OpGuard, path: &Path) -> Result<EntryKind> {
    let lmeta = guard
        .run(fs::symlink_metadata(path), |e| ScpError::filesystem(path, e))
        .await?;

    if lmeta.is_dir() {
        return Ok(EntryKind::Dir(lmeta));
    }
    if lmeta.is_file() {
        return Ok(EntryKind::File);
    }
    if lmeta.file_type().is_symlink() {
        let target = stat(guard, path).await?;
        return Ok(if target.is_file() {
            EntryKind::File
        } else if target.is_dir() {
            EntryKind::Skip("symlinked directory not followed")
        } else {
            EntryKind::Skip("not a regular file")
        });
    }
    Ok(EntryKind::Skip("not a regular file"))
}

pub async fn list_entries(
    guard: &OpGuard,
    dir: &Path,
    order: ListingOrder,
) -> Result<Vec<PathBuf>> {
    let fs_err = |e| ScpError::filesystem(dir, e);
    let mut reader = guard.run(fs::read_dir(dir), fs_err).await?;
    let mut entries = Vec::new();
    while let Some(entry) = guard.run(reader.next_entry(), fs_err).await? {
        entries.push(entry.path());
    }
    if order == ListingOrder::Name {
        entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    }
    Ok(entries)
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Last component of `path` as raw bytes.
#[cfg(unix)]
fn file_name(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.file_name().unwrap_or(path.as_os_str()).as_bytes().to_vec()
}

#[cfg(not(unix))]
fn file_name(path: &Path) -> Vec<u8> {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
        .into_bytes()
}

/// Name for the requested path itself; `.` and `..` are resolved first.
async fn base_name(guard: &OpGuard, path: &Path) -> Result<Vec<u8>> {
    if path.file_name().is_some() {
        return Ok(file_name(path));
    }
    let resolved = guard
        .run(fs::canonicalize(path), |e| ScpError::filesystem(path, e))
        .await?;
    Ok(file_name(&resolved))
}
