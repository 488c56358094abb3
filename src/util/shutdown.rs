use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Process shutdown signaling.
///
/// Listens for SIGTERM and SIGINT and exposes the outcome as a cancellation
/// token. The serve loop awaits [`Shutdown::requested`] as its
/// graceful-shutdown future; background subsystems that want to observe
/// shutdown themselves clone [`Shutdown::token`].
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Registers the signal handlers and starts listening.
    ///
    /// # Errors
    ///
    /// Returns an error if signal registration with the OS fails.
    pub fn listen() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let notifier = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
            }
            notifier.cancel();
        });
        Ok(Self { token })
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }

    /// A token for subsystems that observe shutdown on their own.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requested_resolves_after_cancellation() {
        let shutdown = Shutdown::listen().unwrap();
        shutdown.token().cancel();
        shutdown.requested().await;
    }

    #[tokio::test]
    async fn requested_is_pending_until_cancelled() {
        let shutdown = Shutdown::listen().unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), shutdown.requested()).await;
        assert!(pending.is_err());
    }
}
