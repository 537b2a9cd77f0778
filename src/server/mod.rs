//! Protocol dispatcher - picks the engine for an accepted channel.
//!
//! The transport hands over the data stream of one channel plus its
//! open-time descriptor. Out-of-band channel requests (keepalives and the
//! like) are consumed by the transport and never reach this stream.

use crate::config::ResponderConfig;
use crate::error::Result;
use crate::guard::OpGuard;
use crate::observer::TransferObserver;
use crate::protocol::{Role, ScpChannel, TransferRequest, TransferStats};
use crate::sink::{Sink, SinkConfig};
use crate::source::{Source, SourceConfig};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

pub struct Dispatcher {
    config: ResponderConfig,
    observer: Arc<dyn TransferObserver>,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: ResponderConfig, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            config,
            observer,
            token: CancellationToken::new(),
        }
    }

    /// Cancelling `token` aborts every transfer served by this dispatcher.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Serve a channel whose descriptor is still in SSH wire encoding.
    /// An undecodable descriptor or unknown mode closes the channel without
    /// any protocol exchange.
    pub async fn serve_channel<R, W>(
        &self,
        reader: R,
        mut writer: W,
        descriptor: Bytes,
    ) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match TransferRequest::decode(descriptor) {
            Ok(request) => self.serve(reader, writer, request).await,
            Err(e) => {
                tracing::warn!("Rejecting scp channel: {}", e);
                if let Err(close) = writer.shutdown().await {
                    tracing::debug!("channel shutdown: {}", close);
                }
                Err(e)
            }
        }
    }

    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        request: TransferRequest,
    ) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let path = if self.config.expand_tilde {
            expand_tilde(Path::new(&request.path))
        } else {
            PathBuf::from(&request.path)
        };
        tracing::info!(role = %request.role, path = %path.display(), "scp transfer starting");

        let guard = OpGuard::new(self.token.child_token(), self.config.op_timeout());
        let mut chan = ScpChannel::new(reader, writer, guard);

        let result = match request.role {
            Role::Sink => {
                let mut sink = Sink::new(
                    SinkConfig {
                        destination: path,
                        max_desync_records: self.config.max_desync_records,
                    },
                    self.observer.clone(),
                );
                sink.run(&mut chan).await
            }
            Role::Source => {
                let mut source = Source::new(
                    SourceConfig {
                        path,
                        listing_order: self.config.listing_order,
                    },
                    self.observer.clone(),
                );
                source.run(&mut chan).await
            }
        };

        chan.shutdown().await;

        match &result {
            Ok(stats) => tracing::info!(
                role = %request.role,
                files = stats.files,
                directories = stats.directories,
                bytes = stats.bytes,
                rejected = stats.files_rejected,
                warnings = stats.warnings,
                "scp transfer finished"
            ),
            Err(e) => tracing::warn!(role = %request.role, "scp transfer failed: {}", e),
        }
        result
    }
}
