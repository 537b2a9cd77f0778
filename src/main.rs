use anyhow::{Context, Result};
use clap::Parser;
use scp_responder::{
    Dispatcher, ListingOrder, ResponderConfig, Role, TracingObserver, TransferRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

/// Answer one scp transfer on stdin/stdout, as `scp -t` or `scp -f` would
/// on the remote end of an SSH session.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Receive files into PATH
    #[arg(short = 't', conflicts_with = "from")]
    to: bool,

    /// Send PATH
    #[arg(short = 'f')]
    from: bool,

    /// Recursive copy (always enabled, accepted for compatibility)
    #[arg(short = 'r')]
    recursive: bool,

    /// Target must be a directory (accepted for compatibility)
    #[arg(short = 'd')]
    target_dir: bool,

    /// Preserve times. Only meaningful with -f, where it is ignored; a
    /// receiving transfer cannot take the time records it implies.
    #[arg(short = 'p')]
    preserve: bool,

    /// TOML configuration file
    #[arg(long, env = "SCP_RESPONDER_CONFIG")]
    config: Option<PathBuf>,

    /// Per-operation deadline in seconds
    #[arg(long, env = "SCP_RESPONDER_TIMEOUT")]
    timeout: Option<u64>,

    /// Consecutive unrecognised lines tolerated inside a directory
    #[arg(long)]
    max_desync: Option<u32>,

    /// Emit directory entries in listing order instead of sorted by name
    #[arg(long)]
    native_order: bool,

    path: String,
}

impl Cli {
    fn role(&self) -> Result<Role> {
        match (self.to, self.from) {
            (true, false) if self.preserve => {
                anyhow::bail!("-p is not supported when receiving (-t)")
            }
            (true, false) => Ok(Role::Sink),
            (false, true) => Ok(Role::Source),
            _ => anyhow::bail!("exactly one of -t or -f is required"),
        }
    }

    fn load_config(&self) -> Result<ResponderConfig> {
        let mut config = match &self.config {
            Some(path) => ResponderConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ResponderConfig::default(),
        };
        if self.timeout.is_some() {
            config.op_timeout_secs = self.timeout;
        }
        if let Some(n) = self.max_desync {
            config.max_desync_records = n;
        }
        if self.native_order {
            config.listing_order = ListingOrder::Native;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let role = cli.role()?;
    let config = cli.load_config()?;
    tracing::debug!(
        ?config,
        recursive = cli.recursive,
        target_dir = cli.target_dir,
        preserve = cli.preserve,
        "starting"
    );

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfer");
            ctrl_c_token.cancel();
        }
    });

    let dispatcher = Dispatcher::new(config, Arc::new(TracingObserver)).with_cancellation(token);
    let request = TransferRequest::new(role, cli.path);

    dispatcher
        .serve(tokio::io::stdin(), tokio::io::stdout(), request)
        .await
        .context("scp transfer failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("scp-responder").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_role_flags() {
        assert_eq!(parse(&["-t", "/in"]).role().unwrap(), Role::Sink);
        assert_eq!(parse(&["-r", "-f", "/out"]).role().unwrap(), Role::Source);
        assert!(parse(&["/nowhere"]).role().is_err());
        assert!(Cli::try_parse_from(["scp-responder", "-t", "-f", "/x"]).is_err());
    }

    #[test]
    fn test_preserve_only_when_sending() {
        assert_eq!(parse(&["-p", "-f", "/out"]).role().unwrap(), Role::Source);
        assert!(parse(&["-p", "-t", "/in"]).role().is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let config = parse(&["--timeout", "7", "--native-order", "-t", "/in"])
            .load_config()
            .unwrap();
        assert_eq!(config.op_timeout_secs, Some(7));
        assert_eq!(config.listing_order, ListingOrder::Native);
        assert_eq!(config.max_desync_records, 3);
    }
}
