//! In-memory analytics storage (append-only vectors, linear scans).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tardis_types::{AnalyticsError, AnalyticsEvent, AnalyticsStore, MetricPoint, MetricQuery};
use tokio::sync::RwLock;

/// In-memory AnalyticsStore. Rows live for the process lifetime unless purged.
pub struct InMemoryAnalyticsStore {
    metrics: Arc<RwLock<Vec<MetricPoint>>>,
    events: Arc<RwLock<Vec<AnalyticsEvent>>>,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Vec::new())),
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryAnalyticsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn in_range(ts: DateTime<Utc>, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.map(|s| ts >= s).unwrap_or(true) && end.map(|e| ts < e).unwrap_or(true)
}

#[async_trait::async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn record_metrics(&self, points: &[MetricPoint]) -> Result<(), AnalyticsError> {
        if let Some(bad) = points.iter().find(|p| p.name.is_empty() || !p.value.is_finite()) {
            return Err(AnalyticsError::InvalidQuery(format!(
                "metric point {} needs a name and a finite value",
                bad.id
            )));
        }
        self.metrics.write().await.extend_from_slice(points);
        Ok(())
    }

    async fn record_event(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        if event.event_type.is_empty() {
            return Err(AnalyticsError::InvalidQuery("event_type must not be empty".to_string()));
        }
        self.events.write().await.push(event);
        Ok(())
    }

    async fn query_metrics(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, AnalyticsError> {
        let guard = self.metrics.read().await;
        let mut out: Vec<MetricPoint> = guard.iter().filter(|p| query.matches(p)).cloned().collect();
        out.sort_by_key(|p| p.timestamp);
        Ok(out)
    }

    async fn query_events(
        &self,
        event_type: Option<&str>,
        user_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnalyticsEvent>, AnalyticsError> {
        let guard = self.events.read().await;
        let mut out: Vec<AnalyticsEvent> = guard
            .iter()
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .filter(|e| user_id.map(|u| e.user_id.as_deref() == Some(u)).unwrap_or(true))
            .filter(|e| in_range(e.timestamp, start, end))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.timestamp);
        Ok(out)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AnalyticsError> {
        let mut metrics = self.metrics.write().await;
        let mut events = self.events.write().await;
        let before = metrics.len() + events.len();
        metrics.retain(|p| p.timestamp >= cutoff);
        events.retain(|e| e.timestamp >= cutoff);
        Ok(before - metrics.len() - events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;
    use tardis_types::{new_id, Aggregation, TimeBucket};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn range_query_and_hourly_sum() {
        let store = InMemoryAnalyticsStore::new();
        let t = base();
        store
            .record_metrics(&[
                MetricPoint::new("tokens", 100.0, t + Duration::minutes(50)),
                MetricPoint::new("tokens", 50.0, t),
                MetricPoint::new("tokens", 25.0, t + Duration::hours(2)),
                MetricPoint::new("latency_ms", 900.0, t),
            ])
            .await
            .unwrap();

        let mut q = MetricQuery::named("tokens");
        let all = store.query_metrics(&q).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].value, 50.0);

        q.end = Some(t + Duration::hours(2));
        let sums = store
            .aggregate(&q, TimeBucket::Hour, Aggregation::Sum)
            .await
            .unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].bucket_start, t);
        assert_eq!(sums[0].value, 150.0);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let store = InMemoryAnalyticsStore::new();
        let q = MetricQuery {
            name: "tokens".to_string(),
            start: Some(base()),
            end: Some(base() - Duration::hours(1)),
            tags: HashMap::new(),
        };
        let err = store
            .aggregate(&q, TimeBucket::Day, Aggregation::Count)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn events_filter_and_purge() {
        let store = InMemoryAnalyticsStore::new();
        let t = base();
        for (i, user) in ["u1", "u2", "u1"].iter().enumerate() {
            store
                .record_event(AnalyticsEvent {
                    id: new_id(),
                    event_type: "login".to_string(),
                    user_id: Some(user.to_string()),
                    timestamp: t + Duration::days(i as i64),
                    properties: HashMap::new(),
                })
                .await
                .unwrap();
        }
        store
            .record_metrics(&[MetricPoint::new("tokens", 1.0, t)])
            .await
            .unwrap();

        let u1 = store.query_events(Some("login"), Some("u1"), None, None).await.unwrap();
        assert_eq!(u1.len(), 2);

        let removed = store.purge_before(t + Duration::days(1)).await.unwrap();
        assert_eq!(removed, 2);
        let left = store.query_events(None, None, None, None).await.unwrap();
        assert_eq!(left.len(), 2);
    }
}
