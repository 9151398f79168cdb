//! Axum server and routes.

use crate::config::TardisConfig;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tardis_analytics::SqliteAnalyticsStore;
use tardis_incident::InMemoryIncidentStore;
use tardis_llm::{FallbackManager, FallbackOutcome, StrategyStats};
use tardis_quota::{QuotaManager, UsageTracker};
use tardis_types::{
    new_id, now, ActionStatus, Aggregation, AnalyticsEvent, AnalyticsStore, ApiKeyRecord,
    BaseResponse, BlobMetadata, BucketValue, CompletionRequest, ConsentGrant, ConsentLevel,
    ConsentRecord, DataCategory, ErrorCode, Evidence, FallbackError, Incident, IncidentFilter,
    IncidentPatch, IncidentStatus, IncidentStore, IncidentSummary, KeyFilter, Metadata,
    MetricPoint, MetricQuery, NewAction, NewApiKey, NewEvidence, NewIncident, QuotaStatus,
    ResponseAction, TimeBucket,
};
use tardis_vault::{
    ApiKeyManager, FileSystemBackend, KeyRing, PrivacyManager, RotationReport, SecureDataManager,
    StoreOptions,
};
use tower_http::cors::CorsLayer;

const MB: u64 = 1024 * 1024;

pub struct AppState {
    pub incidents: Arc<dyn IncidentStore>,
    pub api_keys: Arc<ApiKeyManager>,
    pub privacy: Arc<PrivacyManager>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub vault: Arc<SecureDataManager>,
    pub quota: Arc<QuotaManager>,
    pub usage: Arc<UsageTracker>,
    pub llm: Arc<FallbackManager>,
}

impl AppState {
    /// Open every file-backed store under `cfg.data_dir`.
    pub async fn open(
        cfg: &TardisConfig,
        llm: FallbackManager,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        tokio::fs::create_dir_all(&cfg.data_dir).await?;
        let (key_ring, blob_ring) = match cfg.master_key {
            Some(ref encoded) => (KeyRing::from_base64(encoded)?, KeyRing::from_base64(encoded)?),
            None => {
                tracing::warn!("TARDIS_MASTER_KEY not set; stored secrets will not survive a restart");
                (KeyRing::generate(), KeyRing::generate())
            }
        };
        let analytics: Arc<dyn AnalyticsStore> =
            Arc::new(SqliteAnalyticsStore::new(cfg.analytics_path())?);
        let backend = Arc::new(FileSystemBackend::new(cfg.blobs_dir()).await?);
        Ok(Self {
            incidents: Arc::new(InMemoryIncidentStore::new()),
            api_keys: Arc::new(ApiKeyManager::new(cfg.keys_dir(), key_ring).await?),
            privacy: Arc::new(PrivacyManager::open(cfg.consent_path()).await?),
            usage: Arc::new(UsageTracker::new(Arc::clone(&analytics))),
            analytics,
            vault: Arc::new(SecureDataManager::open(backend, blob_ring).await?),
            quota: Arc::new(QuotaManager::default()),
            llm: Arc::new(llm),
        })
    }
}

/// Periodically persist expiry of API keys and consents.
pub fn spawn_maintenance(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = state.api_keys.sweep_expired().await {
                tracing::error!(error = %e, "api key sweep failed");
            }
            if let Err(e) = state.privacy.expire_stale().await {
                tracing::error!(error = %e, "consent sweep failed");
            }
        }
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/incidents/create", post(handle_incident_create))
        .route("/incidents/get", post(handle_incident_get))
        .route("/incidents/list", post(handle_incident_list))
        .route("/incidents/update", post(handle_incident_update))
        .route("/incidents/status", post(handle_incident_status))
        .route("/incidents/evidence", post(handle_incident_evidence))
        .route("/incidents/action", post(handle_incident_action))
        .route("/incidents/action/update", post(handle_incident_action_update))
        .route("/incidents/delete", post(handle_incident_delete))
        .route("/incidents/summary", get(handle_incident_summary))
        .route("/keys/create", post(handle_key_create))
        .route("/keys/get", post(handle_key_get))
        .route("/keys/list", post(handle_key_list))
        .route("/keys/reveal", post(handle_key_reveal))
        .route("/keys/usage", post(handle_key_usage))
        .route("/keys/rotate", post(handle_key_rotate))
        .route("/keys/revoke", post(handle_key_revoke))
        .route("/keys/delete", post(handle_key_delete))
        .route("/keys/sweep", post(handle_key_sweep))
        .route("/consent/set", post(handle_consent_set))
        .route("/consent/get", post(handle_consent_get))
        .route("/consent/check", post(handle_consent_check))
        .route("/consent/withdraw", post(handle_consent_withdraw))
        .route("/consent/list", post(handle_consent_list))
        .route("/consent/expire", post(handle_consent_expire))
        .route("/consent/forget", post(handle_consent_forget))
        .route("/analytics/metrics", post(handle_metrics_record))
        .route("/analytics/event", post(handle_event_record))
        .route("/analytics/query", post(handle_metrics_query))
        .route("/analytics/aggregate", post(handle_metrics_aggregate))
        .route("/analytics/events", post(handle_events_query))
        .route("/analytics/purge", post(handle_analytics_purge))
        .route("/vault/store", post(handle_vault_store))
        .route("/vault/retrieve", post(handle_vault_retrieve))
        .route("/vault/metadata", post(handle_vault_metadata))
        .route("/vault/grant", post(handle_vault_grant))
        .route("/vault/revoke", post(handle_vault_revoke))
        .route("/vault/delete", post(handle_vault_delete))
        .route("/vault/list", post(handle_vault_list))
        .route("/vault/rotate", post(handle_vault_rotate))
        .route("/quota/check", post(handle_quota_check))
        .route("/quota/usage", post(handle_quota_usage))
        .route("/quota/reset", post(handle_quota_reset))
        .route("/quota/flush", post(handle_quota_flush))
        .route("/llm/complete", post(handle_llm_complete))
        .route("/llm/stats", get(handle_llm_stats))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResponse<T> = Json<BaseResponse<T>>;

fn reply<T, E: ErrorCode + std::fmt::Display>(result: Result<T, E>) -> ApiResponse<T> {
    Json(BaseResponse::from_result(result))
}

fn bad_request<T>(message: impl Into<String>) -> ApiResponse<T> {
    Json(BaseResponse::error(400, message))
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct IdActorRequest {
    pub id: String,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

// ---- incidents ----

#[derive(Debug, Deserialize)]
pub struct CreateIncidentRequest {
    pub actor: String,
    pub incident: NewIncident,
}

async fn handle_incident_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateIncidentRequest>,
) -> ApiResponse<Incident> {
    if let Err(e) = state.quota.consume(&req.actor, "incidents", 1).await {
        return reply(Err(e));
    }
    let result = state.incidents.create_incident(req.incident, &req.actor).await;
    match result {
        Ok(_) => state.usage.track(&req.actor, "incidents", 1).await,
        Err(_) => {
            let _ = state.quota.release(&req.actor, "incidents", 1).await;
        }
    }
    reply(result)
}

async fn handle_incident_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdRequest>,
) -> ApiResponse<Incident> {
    reply(state.incidents.get_incident(&req.id).await)
}

async fn handle_incident_list(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<IncidentFilter>,
) -> ApiResponse<Vec<Incident>> {
    reply(state.incidents.list_incidents(&filter).await)
}

#[derive(Debug, Deserialize)]
pub struct UpdateIncidentRequest {
    pub id: String,
    pub actor: String,
    pub patch: IncidentPatch,
}

async fn handle_incident_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateIncidentRequest>,
) -> ApiResponse<Incident> {
    reply(state.incidents.update_incident(&req.id, req.patch, &req.actor).await)
}

#[derive(Debug, Deserialize)]
pub struct IncidentStatusRequest {
    pub id: String,
    pub actor: String,
    pub status: IncidentStatus,
    #[serde(default)]
    pub note: Option<String>,
}

async fn handle_incident_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IncidentStatusRequest>,
) -> ApiResponse<Incident> {
    reply(
        state
            .incidents
            .update_status(&req.id, req.status, &req.actor, req.note.as_deref())
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct AddEvidenceRequest {
    pub id: String,
    pub actor: String,
    pub evidence: NewEvidence,
}

async fn handle_incident_evidence(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddEvidenceRequest>,
) -> ApiResponse<Evidence> {
    reply(state.incidents.add_evidence(&req.id, req.evidence, &req.actor).await)
}

#[derive(Debug, Deserialize)]
pub struct AddActionRequest {
    pub id: String,
    pub actor: String,
    pub action: NewAction,
}

async fn handle_incident_action(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddActionRequest>,
) -> ApiResponse<ResponseAction> {
    reply(state.incidents.add_action(&req.id, req.action, &req.actor).await)
}

#[derive(Debug, Deserialize)]
pub struct UpdateActionRequest {
    pub id: String,
    pub action_id: String,
    pub actor: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub result: Option<String>,
}

async fn handle_incident_action_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateActionRequest>,
) -> ApiResponse<ResponseAction> {
    reply(
        state
            .incidents
            .update_action(&req.id, &req.action_id, req.status, req.result, &req.actor)
            .await,
    )
}

async fn handle_incident_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdActorRequest>,
) -> ApiResponse<()> {
    reply(state.incidents.delete_incident(&req.id, &req.actor).await)
}

async fn handle_incident_summary(State(state): State<Arc<AppState>>) -> ApiResponse<IncidentSummary> {
    reply(state.incidents.summary().await)
}

// ---- api keys ----

async fn handle_key_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewApiKey>,
) -> ApiResponse<ApiKeyRecord> {
    reply(state.api_keys.create_key(req).await)
}

async fn handle_key_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdRequest>,
) -> ApiResponse<ApiKeyRecord> {
    reply(state.api_keys.get_key(&req.id).await)
}

async fn handle_key_list(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<KeyFilter>,
) -> ApiResponse<Vec<ApiKeyRecord>> {
    reply(state.api_keys.list_keys(&filter).await)
}

async fn handle_key_reveal(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdActorRequest>,
) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .api_keys
            .reveal_key(&req.id, &req.actor)
            .await
            .map(|secret| json!({ "id": req.id, "secret": secret })),
    )
}

async fn handle_key_usage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdRequest>,
) -> ApiResponse<ApiKeyRecord> {
    reply(state.api_keys.record_usage(&req.id).await)
}

#[derive(Debug, Deserialize)]
pub struct RotateKeyRequest {
    pub id: String,
    pub actor: String,
    pub secret: String,
}

async fn handle_key_rotate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RotateKeyRequest>,
) -> ApiResponse<ApiKeyRecord> {
    reply(state.api_keys.rotate_key(&req.id, &req.secret, &req.actor).await)
}

#[derive(Debug, Deserialize)]
pub struct RevokeKeyRequest {
    pub id: String,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn handle_key_revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeKeyRequest>,
) -> ApiResponse<ApiKeyRecord> {
    reply(
        state
            .api_keys
            .revoke_key(&req.id, &req.actor, req.reason.as_deref())
            .await,
    )
}

async fn handle_key_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdActorRequest>,
) -> ApiResponse<()> {
    reply(state.api_keys.delete_key(&req.id, &req.actor).await)
}

async fn handle_key_sweep(State(state): State<Arc<AppState>>) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .api_keys
            .sweep_expired()
            .await
            .map(|n| json!({ "expired": n })),
    )
}

// ---- consent ----

#[derive(Debug, Deserialize)]
pub struct SetConsentRequest {
    pub actor: String,
    pub grant: ConsentGrant,
}

async fn handle_consent_set(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetConsentRequest>,
) -> ApiResponse<ConsentRecord> {
    reply(state.privacy.set_consent(req.grant, &req.actor).await)
}

#[derive(Debug, Deserialize)]
pub struct ConsentQuery {
    pub user_id: String,
    pub category: DataCategory,
    #[serde(default)]
    pub required: Option<ConsentLevel>,
}

async fn handle_consent_get(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConsentQuery>,
) -> ApiResponse<ConsentLevel> {
    Json(BaseResponse::ok(
        state.privacy.get_user_consent(&req.user_id, req.category).await,
    ))
}

async fn handle_consent_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConsentQuery>,
) -> ApiResponse<serde_json::Value> {
    let required = req.required.unwrap_or(ConsentLevel::Minimal);
    let allowed = state
        .privacy
        .check_consent(&req.user_id, req.category, required)
        .await;
    Json(BaseResponse::ok(json!({ "allowed": allowed, "required": required })))
}

#[derive(Debug, Deserialize)]
pub struct WithdrawConsentRequest {
    pub user_id: String,
    pub category: DataCategory,
    pub actor: String,
}

async fn handle_consent_withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WithdrawConsentRequest>,
) -> ApiResponse<ConsentRecord> {
    reply(
        state
            .privacy
            .withdraw_consent(&req.user_id, req.category, &req.actor)
            .await,
    )
}

async fn handle_consent_list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResponse<Vec<ConsentRecord>> {
    Json(BaseResponse::ok(state.privacy.list_user_consents(&req.user_id).await))
}

async fn handle_consent_expire(State(state): State<Arc<AppState>>) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .privacy
            .expire_stale()
            .await
            .map(|n| json!({ "expired": n })),
    )
}

#[derive(Debug, Deserialize)]
pub struct ForgetUserRequest {
    pub user_id: String,
    pub actor: String,
}

async fn handle_consent_forget(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgetUserRequest>,
) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .privacy
            .forget_user(&req.user_id, &req.actor)
            .await
            .map(|n| json!({ "removed": n })),
    )
}

// ---- analytics ----

#[derive(Debug, Deserialize)]
pub struct MetricInput {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordMetricsRequest {
    pub points: Vec<MetricInput>,
}

async fn handle_metrics_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordMetricsRequest>,
) -> ApiResponse<serde_json::Value> {
    let at = now();
    let points: Vec<MetricPoint> = req
        .points
        .into_iter()
        .map(|p| MetricPoint {
            tags: p.tags,
            ..MetricPoint::new(p.name, p.value, p.timestamp.unwrap_or(at))
        })
        .collect();
    let recorded = points.len();
    reply(
        state
            .analytics
            .record_metrics(&points)
            .await
            .map(|_| json!({ "recorded": recorded })),
    )
}

#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Metadata,
}

async fn handle_event_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordEventRequest>,
) -> ApiResponse<AnalyticsEvent> {
    let event = AnalyticsEvent {
        id: new_id(),
        event_type: req.event_type,
        user_id: req.user_id,
        timestamp: req.timestamp.unwrap_or_else(now),
        properties: req.properties,
    };
    reply(state.analytics.record_event(event.clone()).await.map(|_| event))
}

async fn handle_metrics_query(
    State(state): State<Arc<AppState>>,
    Json(query): Json<MetricQuery>,
) -> ApiResponse<Vec<MetricPoint>> {
    reply(state.analytics.query_metrics(&query).await)
}

#[derive(Debug, Deserialize)]
pub struct AggregateRequest {
    pub query: MetricQuery,
    pub bucket: TimeBucket,
    pub aggregation: Aggregation,
}

async fn handle_metrics_aggregate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AggregateRequest>,
) -> ApiResponse<Vec<BucketValue>> {
    reply(
        state
            .analytics
            .aggregate(&req.query, req.bucket, req.aggregation)
            .await,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

async fn handle_events_query(
    State(state): State<Arc<AppState>>,
    Json(q): Json<EventsQuery>,
) -> ApiResponse<Vec<AnalyticsEvent>> {
    reply(
        state
            .analytics
            .query_events(q.event_type.as_deref(), q.user_id.as_deref(), q.start, q.end)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub before: DateTime<Utc>,
}

async fn handle_analytics_purge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurgeRequest>,
) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .analytics
            .purge_before(req.before)
            .await
            .map(|n| json!({ "removed": n })),
    )
}

// ---- vault ----

fn size_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MB)
}

#[derive(Debug, Deserialize)]
pub struct StoreBlobRequest {
    pub owner: String,
    /// Base64-encoded plaintext.
    pub data: String,
    #[serde(default)]
    pub options: StoreOptions,
}

async fn handle_vault_store(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StoreBlobRequest>,
) -> ApiResponse<serde_json::Value> {
    let data = match STANDARD.decode(req.data.as_bytes()) {
        Ok(d) => d,
        Err(e) => return bad_request(format!("data is not valid base64: {}", e)),
    };
    let mb = size_mb(data.len() as u64);
    if let Err(e) = state.quota.consume(&req.owner, "storage_mb", mb).await {
        return reply(Err(e));
    }
    let result = state.vault.store(&req.owner, &data, req.options).await;
    match result {
        Ok(_) => state.usage.track(&req.owner, "storage_mb", mb).await,
        Err(_) => {
            let _ = state.quota.release(&req.owner, "storage_mb", mb).await;
        }
    }
    reply(result.map(|id| json!({ "id": id, "size": data.len() })))
}

#[derive(Debug, Deserialize)]
pub struct BlobAccessRequest {
    pub id: String,
    pub requester: String,
}

async fn handle_vault_retrieve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlobAccessRequest>,
) -> ApiResponse<serde_json::Value> {
    reply(
        state
            .vault
            .retrieve(&req.id, &req.requester)
            .await
            .map(|data| json!({ "id": req.id, "data": STANDARD.encode(data) })),
    )
}

async fn handle_vault_metadata(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlobAccessRequest>,
) -> ApiResponse<BlobMetadata> {
    reply(state.vault.metadata(&req.id, &req.requester).await)
}

#[derive(Debug, Deserialize)]
pub struct BlobShareRequest {
    pub id: String,
    pub actor: String,
    pub user: String,
}

async fn handle_vault_grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlobShareRequest>,
) -> ApiResponse<BlobMetadata> {
    reply(state.vault.grant_access(&req.id, &req.actor, &req.user).await)
}

async fn handle_vault_revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlobShareRequest>,
) -> ApiResponse<BlobMetadata> {
    reply(state.vault.revoke_access(&req.id, &req.actor, &req.user).await)
}

async fn handle_vault_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdActorRequest>,
) -> ApiResponse<()> {
    let meta = match state.vault.metadata(&req.id, &req.actor).await {
        Ok(m) => m,
        Err(e) => return reply(Err(e)),
    };
    let result = state.vault.delete(&req.id, &req.actor).await;
    if result.is_ok() {
        let _ = state
            .quota
            .release(&meta.owner, "storage_mb", size_mb(meta.size))
            .await;
    }
    reply(result)
}

async fn handle_vault_list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResponse<Vec<serde_json::Value>> {
    reply(state.vault.list_for(&req.user_id).await.map(|items| {
        items
            .into_iter()
            .map(|(id, metadata)| json!({ "id": id, "metadata": metadata }))
            .collect()
    }))
}

async fn handle_vault_rotate(State(state): State<Arc<AppState>>) -> ApiResponse<RotationReport> {
    reply(state.vault.rotate_keys().await)
}

// ---- quota ----

#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    pub user_id: String,
    pub resource: String,
    #[serde(default = "default_amount")]
    pub amount: u64,
}

fn default_amount() -> u64 {
    1
}

async fn handle_quota_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QuotaCheckRequest>,
) -> ApiResponse<QuotaStatus> {
    reply(state.quota.check(&req.user_id, &req.resource, req.amount).await)
}

async fn handle_quota_usage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResponse<Vec<QuotaStatus>> {
    Json(BaseResponse::ok(state.quota.usage(&req.user_id).await))
}

async fn handle_quota_reset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResponse<serde_json::Value> {
    let removed = state.quota.reset_user(&req.user_id).await;
    Json(BaseResponse::ok(json!({ "removed": removed })))
}

async fn handle_quota_flush(State(state): State<Arc<AppState>>) -> ApiResponse<serde_json::Value> {
    reply(state.usage.flush().await.map(|n| json!({ "flushed": n })))
}

// ---- llm ----

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub user_id: String,
    pub request: CompletionRequest,
}

async fn record_llm_event(state: &AppState, event_type: &str, user_id: &str, properties: Metadata) {
    let event = AnalyticsEvent {
        id: new_id(),
        event_type: event_type.to_string(),
        user_id: Some(user_id.to_string()),
        timestamp: now(),
        properties,
    };
    if let Err(e) = state.analytics.record_event(event).await {
        tracing::warn!(error = %e, event_type, "failed to record llm event");
    }
}

async fn handle_llm_complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteRequest>,
) -> ApiResponse<FallbackOutcome> {
    let tokens_left = match state.quota.check(&req.user_id, "tokens", 1).await {
        Ok(s) if s.allowed => s.remaining,
        Ok(s) => {
            return reply(Err(tardis_types::QuotaError::Exceeded {
                resource: s.resource,
                used: s.used,
                limit: s.limit,
            }))
        }
        Err(e) => return reply(Err(e)),
    };
    if let Err(e) = state.quota.consume(&req.user_id, "api_calls", 1).await {
        return reply(Err(e));
    }
    state.usage.track(&req.user_id, "api_calls", 1).await;

    match state.llm.execute_with_fallback(&req.request).await {
        Ok(outcome) => {
            let tokens = outcome
                .response
                .usage
                .as_ref()
                .map(|u| u64::from(u.total_tokens))
                .unwrap_or(0);
            if tokens > 0 {
                if tokens > tokens_left {
                    tracing::warn!(
                        user_id = %req.user_id,
                        tokens,
                        remaining = tokens_left,
                        "completion overshot the token quota"
                    );
                }
                if let Err(e) = state
                    .quota
                    .consume(&req.user_id, "tokens", tokens.min(tokens_left))
                    .await
                {
                    tracing::warn!(error = %e, user_id = %req.user_id, tokens, "failed to charge tokens");
                }
                state.usage.track(&req.user_id, "tokens", tokens).await;
            }
            if outcome.fallback_used {
                let props = Metadata::from([
                    ("strategy".to_string(), json!(outcome.strategy)),
                    ("attempts".to_string(), json!(outcome.attempts.len())),
                ]);
                record_llm_event(&state, "llm_fallback", &req.user_id, props).await;
            }
            reply(Ok::<_, FallbackError>(outcome))
        }
        Err(e) => {
            let FallbackError::Exhausted { ref attempts } = e;
            let props = Metadata::from([("attempts".to_string(), json!(attempts))]);
            record_llm_event(&state, "llm_fallback_exhausted", &req.user_id, props).await;
            reply(Err(e))
        }
    }
}

async fn handle_llm_stats(
    State(state): State<Arc<AppState>>,
) -> ApiResponse<BTreeMap<String, StrategyStats>> {
    Json(BaseResponse::ok(state.llm.stats().await))
}

async fn handle_health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_sizes_round_up_to_whole_megabytes() {
        assert_eq!(size_mb(0), 0);
        assert_eq!(size_mb(1), 1);
        assert_eq!(size_mb(MB), 1);
        assert_eq!(size_mb(MB + 1), 2);
    }
}
