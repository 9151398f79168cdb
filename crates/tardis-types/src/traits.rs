//! Traits at the storage and provider seams.

use crate::{
    aggregate_points, ActionStatus, Aggregation, AnalyticsError, AnalyticsEvent, BlobMetadata,
    BucketValue, CompletionRequest, CompletionResponse, Evidence, Incident, IncidentError,
    IncidentFilter, IncidentPatch, IncidentStatus, IncidentSummary, LlmError, MetricPoint,
    MetricQuery, NewAction, NewEvidence, NewIncident, ResponseAction, StorageError, TimeBucket,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Incident store: CRUD over incidents plus their evidence and response actions.
///
/// Mutations take an `actor`; only the owner or the system actor may mutate.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn create_incident(&self, input: NewIncident, actor: &str)
        -> Result<Incident, IncidentError>;

    async fn get_incident(&self, id: &str) -> Result<Incident, IncidentError>;

    /// Matching incidents, newest first.
    async fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, IncidentError>;

    async fn update_incident(
        &self,
        id: &str,
        patch: IncidentPatch,
        actor: &str,
    ) -> Result<Incident, IncidentError>;

    /// Set status. No transition guard; the change is recorded on the timeline.
    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<Incident, IncidentError>;

    async fn add_evidence(
        &self,
        id: &str,
        input: NewEvidence,
        actor: &str,
    ) -> Result<Evidence, IncidentError>;

    async fn add_action(
        &self,
        id: &str,
        input: NewAction,
        actor: &str,
    ) -> Result<ResponseAction, IncidentError>;

    async fn update_action(
        &self,
        id: &str,
        action_id: &str,
        status: ActionStatus,
        result: Option<String>,
        actor: &str,
    ) -> Result<ResponseAction, IncidentError>;

    async fn delete_incident(&self, id: &str, actor: &str) -> Result<(), IncidentError>;

    async fn summary(&self) -> Result<IncidentSummary, IncidentError>;
}

/// Append-only analytics storage with range queries.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn record_metrics(&self, points: &[MetricPoint]) -> Result<(), AnalyticsError>;

    async fn record_event(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError>;

    /// Matching points, ascending by timestamp.
    async fn query_metrics(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, AnalyticsError>;

    /// Events filtered by type/user within `[start, end)`, ascending by timestamp.
    async fn query_events(
        &self,
        event_type: Option<&str>,
        user_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnalyticsEvent>, AnalyticsError>;

    /// Delete metrics and events older than `cutoff`; returns rows removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AnalyticsError>;

    /// Bucketed aggregation over `query_metrics`. Empty buckets are omitted.
    async fn aggregate(
        &self,
        query: &MetricQuery,
        bucket: TimeBucket,
        aggregation: Aggregation,
    ) -> Result<Vec<BucketValue>, AnalyticsError> {
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if end < start {
                return Err(AnalyticsError::InvalidQuery(
                    "end must not precede start".to_string(),
                ));
            }
        }
        let points = self.query_metrics(query).await?;
        Ok(aggregate_points(&points, bucket, aggregation))
    }
}

/// Blob storage with a JSON metadata sidecar per key.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], metadata: &BlobMetadata)
        -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMetadata)>, StorageError>;

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StorageError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys, sorted.
    async fn list(&self) -> Result<Vec<String>, StorageError>;
}

/// Chat-completion provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
