//! Lifecycle event ingestion
//!
//! Drains the venue's order lifecycle stream into the position ledger, in
//! delivery order. Gaps (reconnects, desynced or failed items) are closed by
//! reconciling the ledger from a fresh REST snapshot.
//!
//! While a reconcile is outstanding the ledger is stale: fills are dropped
//! (the next snapshot already contains them) and the reconcile is retried
//! before every following item. The end of the stream is reconciled and
//! reported through the notifier.

use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::notify::{notify_best_effort, Notifier};
use crate::adapters::retry::{with_retry, RetryConfig};
use crate::domain::{EventKind, LifecycleEvent, LifecycleUpdate};
use crate::error::PosguardError;
use crate::exchange::{Gateway, LifecycleStream};
use crate::ledger::LedgerHandle;

/// Counters reported when the ingestor exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events_applied: u64,
    /// Fills dropped while the ledger was stale
    pub events_skipped: u64,
    pub reconciles: u64,
    pub desyncs: u64,
    pub reconcile_failures: u64,
    /// The venue closed the stream (as opposed to the ledger going away)
    pub stream_ended: bool,
}

enum Reconcile {
    Synced,
    Stale,
    LedgerGone,
}

pub struct EventIngestor {
    gateway: Arc<dyn Gateway>,
    ledger: LedgerHandle,
    retry: RetryConfig,
    notifier: Option<Arc<dyn Notifier>>,
    stale: bool,
    stats: IngestStats,
}

impl EventIngestor {
    pub fn new(gateway: Arc<dyn Gateway>, ledger: LedgerHandle) -> Self {
        Self {
            gateway,
            ledger,
            retry: RetryConfig::default(),
            notifier: None,
            stale: false,
            stats: IngestStats::default(),
        }
    }

    /// Backoff for reconcile fetches
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Consume `stream` until it ends or the ledger goes away.
    pub async fn run(mut self, mut stream: LifecycleStream) -> IngestStats {
        let instrument = self.gateway.instrument();
        info!("Event ingestor started for {}", instrument);

        while let Some(item) = stream.next().await {
            if self.stale && matches!(self.reconcile().await, Reconcile::LedgerGone) {
                return self.finish();
            }

            let resync = match item {
                Ok(LifecycleUpdate::Event(event)) => match self.apply(event).await {
                    Some(resync) => resync,
                    None => return self.finish(),
                },
                Ok(LifecycleUpdate::Resubscribed) => {
                    info!("Lifecycle stream resubscribed; reconciling position");
                    true
                }
                Err(e) => {
                    warn!("Lifecycle stream error: {}", e);
                    true
                }
            };

            if resync && matches!(self.reconcile().await, Reconcile::LedgerGone) {
                return self.finish();
            }
        }

        self.stats.stream_ended = true;
        error!("Lifecycle stream for {} ended", instrument);
        let outcome = match self.reconcile().await {
            Reconcile::Synced => "position reconciled from REST",
            Reconcile::Stale => "position may be stale",
            Reconcile::LedgerGone => "ledger closed",
        };
        notify_best_effort(
            self.notifier.as_ref(),
            &format!(
                "{} lifecycle stream ended ({}); fills are no longer tracked",
                instrument, outcome
            ),
        )
        .await;

        self.finish()
    }

    /// Apply one event. `Some(true)` asks for a reconcile, `None` means the
    /// ledger is gone.
    async fn apply(&mut self, event: LifecycleEvent) -> Option<bool> {
        if self.stale && event.kind == EventKind::Execution {
            self.stats.events_skipped += 1;
            warn!(
                acceptance_id = %event.acceptance_id,
                "Ledger stale, dropping fill until the next reconcile"
            );
            return Some(false);
        }

        match self.ledger.apply(event).await {
            Ok(outcome) => {
                self.stats.events_applied += 1;
                debug!("Applied lifecycle event: {:?}", outcome);
                Some(false)
            }
            Err(PosguardError::StreamDesync(reason)) => {
                self.stats.desyncs += 1;
                warn!("Lifecycle stream desync: {}", reason);
                Some(true)
            }
            Err(e) => {
                error!("Position ledger unavailable: {}", e);
                None
            }
        }
    }

    /// Overwrite the ledger position from REST, retrying the fetch with
    /// backoff. A fetch that still fails leaves the ledger stale.
    async fn reconcile(&mut self) -> Reconcile {
        let gateway = self.gateway.clone();
        let snapshot = match with_retry(&self.retry, || gateway.fetch_position()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.reconcile_failures += 1;
                if !self.stale {
                    error!("Reconcile fetch failed, ledger is stale: {}", e);
                }
                self.stale = true;
                return Reconcile::Stale;
            }
        };

        match self.ledger.reconcile(snapshot).await {
            Ok(_) => {
                if self.stale {
                    info!("Ledger back in sync at {}", snapshot);
                }
                self.stale = false;
                self.stats.reconciles += 1;
                Reconcile::Synced
            }
            Err(e) => {
                error!("Position ledger unavailable: {}", e);
                Reconcile::LedgerGone
            }
        }
    }

    fn finish(self) -> IngestStats {
        info!(
            events = self.stats.events_applied,
            skipped = self.stats.events_skipped,
            reconciles = self.stats.reconciles,
            desyncs = self.stats.desyncs,
            stream_ended = self.stats.stream_ended,
            "Event ingestor stopped"
        );
        self.stats
    }
}
