//! Cancellation and per-operation deadlines.
//!
//! Every channel and filesystem call made by the engines runs through
//! [`OpGuard::run`], so closing the token or hitting the deadline unwinds
//! the engine promptly instead of waiting on a stalled peer.

use crate::error::{Result, ScpError};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OpGuard {
    token: CancellationToken,
    op_timeout: Option<Duration>,
}

impl Default for OpGuard {
    fn default() -> Self {
        Self::new(CancellationToken::new(), None)
    }
}

impl OpGuard {
    pub fn new(token: CancellationToken, op_timeout: Option<Duration>) -> Self {
        Self { token, op_timeout }
    }

    /// Run `op`, mapping its I/O error with `map_err`.
    pub async fn run<T, F, M>(&self, op: F, map_err: M) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
        M: FnOnce(io::Error) -> ScpError,
    {
        if self.token.is_cancelled() {
            return Err(ScpError::Cancelled);
        }

        let guarded = async {
            match self.op_timeout {
                Some(limit) => match tokio::time::timeout(limit, op).await {
                    Ok(res) => res.map_err(map_err),
                    Err(_) => Err(ScpError::TimedOut(limit)),
                },
                None => op.await.map_err(map_err),
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScpError::Cancelled),
            res = guarded => res,
        }
    }

    /// Channel operation: failures are transport errors.
    pub async fn io<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        self.run(op, ScpError::Transport).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_result_through() {
        let guard = OpGuard::default();
        let value = guard.io(async { Ok::<_, io::Error>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = guard
            .io(async { Err::<(), _>(io::Error::from(io::ErrorKind::BrokenPipe)) })
            .await
            .unwrap_err();
        assert!(matches!(err, ScpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let guard = OpGuard::new(token, None);
        let err = guard.io(async { Ok::<_, io::Error>(()) }).await.unwrap_err();
        assert!(matches!(err, ScpError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_op() {
        let token = CancellationToken::new();
        let guard = OpGuard::new(token.clone(), None);
        let pending = tokio::spawn(async move {
            guard
                .io(std::future::pending::<io::Result<()>>())
                .await
        });
        token.cancel();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ScpError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let guard = OpGuard::new(CancellationToken::new(), Some(Duration::from_secs(5)));
        let err = guard
            .io(std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ScpError::TimedOut(d) if d == Duration::from_secs(5)));
    }
}
