//! Transfer event reporting.
//!
//! Engines report protocol events through [`TransferObserver`] instead of
//! logging directly, so tests can assert on what happened.

use crate::protocol::record::ControlRecord;
use std::path::Path;

pub trait TransferObserver: Send + Sync {
    fn file_received(&self, _path: &Path, _size: u64) {}
    fn file_sent(&self, _path: &Path, _size: u64) {}
    fn directory_entered(&self, _path: &Path) {}
    fn directory_left(&self, _path: &Path) {}
    /// A status byte other than zero arrived at a handshake that does not
    /// abort the transfer.
    fn peer_rejected(&self, _context: &str, _code: u8, _message: Option<&str>) {}
    /// An error record was received from, or sent to, the peer.
    fn warning(&self, _message: &str) {}
    fn desync(&self, _line: &str) {}
    fn record(&self, _record: &ControlRecord) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransferObserver for TracingObserver {
    fn file_received(&self, path: &Path, size: u64) {
        tracing::info!(path = %path.display(), size, "file received");
    }

    fn file_sent(&self, path: &Path, size: u64) {
        tracing::info!(path = %path.display(), size, "file sent");
    }

    fn directory_entered(&self, path: &Path) {
        tracing::debug!(path = %path.display(), "entering directory");
    }

    fn directory_left(&self, path: &Path) {
        tracing::debug!(path = %path.display(), "leaving directory");
    }

    fn peer_rejected(&self, context: &str, code: u8, message: Option<&str>) {
        tracing::warn!(code, message = message.unwrap_or(""), "{}: peer reported failure", context);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn desync(&self, line: &str) {
        tracing::warn!(line, "unrecognised control line");
    }

    fn record(&self, record: &ControlRecord) {
        tracing::trace!(?record, "control record");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TransferObserver for NullObserver {}
