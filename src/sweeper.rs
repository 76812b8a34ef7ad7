//! Periodic background singletons: invoice expiration, confirmation
//! timeouts, and the outbox reconciler.
//!
//! All three run on one ticking loop guarded by a leadership lease, so a
//! horizontally scaled deployment runs exactly one active sweeper. The lease
//! implementation is external; [`LocalLease`] is the single-process stand-in
//! that is always leader.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::event_bus::EventPublisher;
use crate::services::invoices::InvoiceService;
use crate::services::payments::PaymentService;

/// Leadership contract for singleton background work.
#[async_trait]
pub trait LeadershipLease: Send + Sync {
    /// Attempts to take (or keep) leadership of `task`.
    async fn acquire(&self, task: &str) -> bool;
    /// Extends a held lease; false means leadership was lost.
    async fn refresh(&self, task: &str) -> bool;
    /// Gives the lease up voluntarily.
    async fn release(&self, task: &str);
}

/// Always-leader lease for single-process deployments.
#[derive(Default)]
pub struct LocalLease;

#[async_trait]
impl LeadershipLease for LocalLease {
    async fn acquire(&self, _task: &str) -> bool {
        true
    }

    async fn refresh(&self, _task: &str) -> bool {
        true
    }

    async fn release(&self, _task: &str) {}
}

const LEASE_TASK: &str = "checkout-sweeper";

pub struct Sweeper {
    invoices: Arc<InvoiceService>,
    payments: Arc<PaymentService>,
    publisher: Arc<EventPublisher>,
    lease: Arc<dyn LeadershipLease>,
    interval: std::time::Duration,
    confirmation_timeout: Duration,
    outbox_batch: usize,
}

impl Sweeper {
    pub fn new(
        invoices: Arc<InvoiceService>,
        payments: Arc<PaymentService>,
        publisher: Arc<EventPublisher>,
        lease: Arc<dyn LeadershipLease>,
        interval: std::time::Duration,
        confirmation_timeout: Duration,
        outbox_batch: usize,
    ) -> Arc<Self> {
        Arc::new(Sweeper {
            invoices,
            payments,
            publisher,
            lease,
            interval,
            confirmation_timeout,
            outbox_batch,
        })
    }

    /// Starts the ticking loop on the given tracker.
    pub fn spawn(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let sweeper = self.clone();
        tracker.spawn(async move {
            let mut held = false;
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                held = if held {
                    sweeper.lease.refresh(LEASE_TASK).await
                } else {
                    sweeper.lease.acquire(LEASE_TASK).await
                };
                if !held {
                    continue;
                }
                sweeper.tick().await;
            }
            if held {
                sweeper.lease.release(LEASE_TASK).await;
            }
        });
    }

    /// One sweep pass over all three concerns.
    #[instrument(skip_all)]
    pub async fn tick(&self) {
        let now = Utc::now();
        match self.invoices.expire_due(now).await {
            Ok(expired) if expired > 0 => {
                tracing::info!(expired, "Expired overdue invoices");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "Invoice expiry sweep failed"),
        }
        match self
            .payments
            .fail_confirmation_timeouts(now, self.confirmation_timeout)
            .await
        {
            Ok(failed) if failed > 0 => {
                tracing::info!(failed, "Failed payments past confirmation deadline");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "Confirmation timeout sweep failed"),
        }
        match self.publisher.reconcile_outbox(self.outbox_batch).await {
            Ok(published) if published > 0 => {
                tracing::info!(published, "Outbox sweep re-published events");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "Outbox sweep failed"),
        }
    }
}
