//! Buffered usage recording, flushed to analytics as `usage.<resource>` metrics.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tardis_types::{AnalyticsStore, MetricPoint, QuotaError, UsageRecord};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Records held while analytics is unreachable; the oldest are dropped past this.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

pub struct UsageTracker {
    buffer: Mutex<Vec<UsageRecord>>,
    store: Arc<dyn AnalyticsStore>,
    capacity: usize,
}

fn drop_oldest(buffer: &mut Vec<UsageRecord>, capacity: usize) {
    let excess = buffer.len().saturating_sub(capacity);
    if excess > 0 {
        buffer.drain(..excess);
        tracing::warn!(dropped = excess, capacity, "usage buffer full; dropping oldest records");
    }
}

impl UsageTracker {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            store,
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub async fn track(&self, user_id: &str, resource: &str, amount: u64) {
        self.track_at(user_id, resource, amount, Utc::now()).await
    }

    pub async fn track_at(&self, user_id: &str, resource: &str, amount: u64, at: DateTime<Utc>) {
        let mut buffer = self.buffer.lock().await;
        buffer.push(UsageRecord {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            amount,
            timestamp: at,
        });
        drop_oldest(&mut buffer, self.capacity);
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Write buffered records to analytics; returns how many were written.
    /// On failure the records go back to the front of the buffer, which never
    /// grows past its capacity.
    pub async fn flush(&self) -> Result<usize, QuotaError> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(0);
        }
        let points: Vec<MetricPoint> = batch
            .iter()
            .map(|r| {
                MetricPoint::new(format!("usage.{}", r.resource), r.amount as f64, r.timestamp)
                    .with_tag("user_id", r.user_id.clone())
            })
            .collect();
        match self.store.record_metrics(&points).await {
            Ok(()) => {
                tracing::debug!(records = batch.len(), "usage flushed");
                Ok(batch.len())
            }
            Err(e) => {
                tracing::warn!(records = batch.len(), error = %e, "usage flush failed; re-buffering");
                let mut buffer = self.buffer.lock().await;
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                drop_oldest(&mut buffer, self.capacity);
                Err(e.into())
            }
        }
    }

    /// Flush on a fixed interval until the handle is aborted.
    pub fn spawn_flusher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush().await {
                    tracing::error!(error = %e, "periodic usage flush failed");
                }
            }
        })
    }
}
