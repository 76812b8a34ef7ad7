//! Coordinated shutdown on SIGTERM and SIGINT.
//!
//! One root cancellation token fans out to named subsystem tokens: the HTTP
//! server stops accepting requests, the delivery engine finishes in-flight
//! webhook attempts within its grace period, and the sweeper parks. Each
//! subsystem's drain start is logged under its component name, so the
//! shutdown sequence is readable from the logs. Queued deliveries that do
//! not drain in time stay durable for the next startup.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    root: CancellationToken,
    watchers: TaskTracker,
}

impl SigDown {
    /// Registers the process signal handlers.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let root = CancellationToken::new();
        let trigger = root.clone();
        let watchers = TaskTracker::new();
        watchers.spawn(async move {
            let signal_name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = signal_name, "Shutdown requested");
            trigger.cancel();
        });
        Ok(Self { root, watchers })
    }

    /// A cancellation token scoped to one named subsystem. When shutdown
    /// begins, the component's drain start is logged.
    pub fn subsystem(&self, component: &'static str) -> CancellationToken {
        let token = self.root.child_token();
        let observed = token.clone();
        self.watchers.spawn(async move {
            observed.cancelled().await;
            tracing::info!(component, "Subsystem draining");
        });
        token
    }

    #[cfg(test)]
    fn trigger(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subsystem_tokens_follow_root() {
        let sig_down = SigDown::try_new().unwrap();
        let http = sig_down.subsystem("http-server");
        let delivery = sig_down.subsystem("webhook-delivery");
        assert!(!http.is_cancelled());
        assert!(!delivery.is_cancelled());

        sig_down.trigger();
        tokio::time::timeout(Duration::from_secs(1), http.cancelled())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), delivery.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subsystem_cancel_does_not_escape_upward() {
        let sig_down = SigDown::try_new().unwrap();
        let sweeper = sig_down.subsystem("sweeper");
        let http = sig_down.subsystem("http-server");

        // Cancelling one subsystem locally must not drag the others down.
        sweeper.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!http.is_cancelled());
    }
}
