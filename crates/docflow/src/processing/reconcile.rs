//! Periodic recovery loops
//!
//! The reconciliation sweep re-emits ingestion events for documents stuck in
//! `pending`, covering event emissions that were lost after upload. The reaper
//! drops finished jobs from the in-memory registry.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::jobs::JobRegistry;
use crate::config::{JobsConfig, ReconcileConfig};
use crate::error::{Error, Result};
use crate::events::{publish_json, EventPublisher};
use crate::storage::DocumentDb;
use crate::types::{IngestionEvent, Topic};

pub struct ReconciliationSweep {
    db: DocumentDb,
    publisher: Arc<dyn EventPublisher>,
    stale_after: Duration,
    batch_size: usize,
}

impl ReconciliationSweep {
    pub fn new(db: DocumentDb, publisher: Arc<dyn EventPublisher>, config: &ReconcileConfig) -> Self {
        Self {
            db,
            publisher,
            stale_after: Duration::from_secs(config.stale_after_secs),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Re-emit events for stale pending documents; returns how many were sent
    pub async fn sweep_once(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| Error::Config(format!("reconcile.stale_after_secs out of range: {}", e)))?;
        let cutoff = Utc::now() - stale_after;

        let stale = self.db.list_stale_pending(cutoff, self.batch_size)?;
        let mut emitted = 0;
        for doc in &stale {
            let event = IngestionEvent::from(doc);
            match publish_json(self.publisher.as_ref(), Topic::Uploaded.as_str(), &doc.id.to_string(), &event).await {
                Ok(_) => {
                    self.db.touch_attempt(doc.id)?;
                    emitted += 1;
                }
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "Re-emit failed, will try next sweep");
                }
            }
        }

        if emitted > 0 {
            tracing::info!(emitted, found = stale.len(), "Reconciliation re-emitted ingestion events");
        }
        Ok(emitted)
    }

    /// Run `sweep_once` every `interval`
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    tracing::warn!(error = %e, "Reconciliation sweep failed");
                }
            }
        })
    }
}

/// Reap finished jobs on a fixed interval
pub fn spawn_reaper(registry: Arc<JobRegistry>, config: &JobsConfig) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.reaper_interval_secs.max(1));
    let retention = Duration::from_secs(config.retention_secs);
    let history = Duration::from_secs(config.history_retention_secs);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.reap(retention, history);
        }
    })
}
