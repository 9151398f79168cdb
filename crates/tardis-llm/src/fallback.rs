//! Ordered fallback chain around a primary provider.
//!
//! The primary is tried first, then each configured strategy in order. The
//! first success ends the chain; later strategies are never attempted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tardis_types::{
    Attempt, ChatMessage, CompletionRequest, CompletionResponse, FallbackError, LlmError,
    LlmProvider,
};
use tokio::sync::{Mutex, RwLock};

const PRIMARY: &str = "primary";
const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Same provider, different model.
    AlternateModel { model: String },
    /// A registered provider by name, optionally with its own model.
    AlternateProvider {
        provider: String,
        #[serde(default)]
        model: Option<String>,
    },
    /// System messages plus the last user message cut to `max_chars`.
    DegradedInput { max_chars: usize },
    /// Last successful response for an identical request.
    CachedResponse,
}

impl FallbackStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FallbackStrategy::AlternateModel { .. } => "alternate_model",
            FallbackStrategy::AlternateProvider { .. } => "alternate_provider",
            FallbackStrategy::DegradedInput { .. } => "degraded_input",
            FallbackStrategy::CachedResponse => "cached_response",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackOutcome {
    pub response: CompletionResponse,
    pub fallback_used: bool,
    /// Strategy that produced the response; `None` when the primary succeeded.
    pub strategy: Option<String>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// sha256 over model and messages.
fn fingerprint(req: &CompletionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(req.model.as_bytes());
    for m in &req.messages {
        hasher.update([0u8]);
        hasher.update(m.role.as_bytes());
        hasher.update([0u8]);
        hasher.update(m.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn degrade(req: &CompletionRequest, max_chars: usize) -> Option<CompletionRequest> {
    let last_user = req.messages.iter().rev().find(|m| m.role == "user")?;
    let mut messages: Vec<ChatMessage> = req
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .cloned()
        .collect();
    messages.push(ChatMessage {
        role: last_user.role.clone(),
        content: last_user.content.chars().take(max_chars).collect(),
    });
    Some(CompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
    })
}

struct ResponseCache {
    entries: HashMap<String, CompletionResponse>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, key: String, value: CompletionResponse) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

pub struct FallbackManager {
    primary: Arc<dyn LlmProvider>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    strategies: Vec<FallbackStrategy>,
    attempt_timeout: Option<Duration>,
    cache: RwLock<ResponseCache>,
    stats: Mutex<BTreeMap<String, StrategyStats>>,
}

impl FallbackManager {
    pub fn new(primary: Arc<dyn LlmProvider>) -> Self {
        Self {
            primary,
            providers: HashMap::new(),
            strategies: Vec::new(),
            attempt_timeout: None,
            cache: RwLock::new(ResponseCache::new(DEFAULT_CACHE_CAPACITY)),
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a provider reachable through `AlternateProvider`.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<FallbackStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            cache: RwLock::new(ResponseCache::new(capacity)),
            ..self
        }
    }

    /// The usual chain: alternate model (if given), each registered provider,
    /// degraded input, then the cache.
    pub fn default_strategies(
        fallback_model: Option<String>,
        providers: &[&str],
    ) -> Vec<FallbackStrategy> {
        let mut out = Vec::new();
        if let Some(model) = fallback_model {
            out.push(FallbackStrategy::AlternateModel { model });
        }
        for p in providers {
            out.push(FallbackStrategy::AlternateProvider {
                provider: p.to_string(),
                model: None,
            });
        }
        out.push(FallbackStrategy::DegradedInput { max_chars: 2000 });
        out.push(FallbackStrategy::CachedResponse);
        out
    }

    pub fn strategies(&self) -> &[FallbackStrategy] {
        &self.strategies
    }

    pub async fn stats(&self) -> BTreeMap<String, StrategyStats> {
        self.stats.lock().await.clone()
    }

    async fn call(
        &self,
        provider: &dyn LlmProvider,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, provider.complete(req))
                .await
                .map_err(|_| {
                    LlmError::Other(format!("{} timed out after {:?}", provider.name(), limit))
                })?,
            None => provider.complete(req).await,
        }
    }

    async fn run_strategy(
        &self,
        strategy: &FallbackStrategy,
        req: &CompletionRequest,
        key: &str,
    ) -> Result<CompletionResponse, LlmError> {
        match strategy {
            FallbackStrategy::AlternateModel { model } => {
                let alt = CompletionRequest {
                    model: model.clone(),
                    ..req.clone()
                };
                self.call(self.primary.as_ref(), &alt).await
            }
            FallbackStrategy::AlternateProvider { provider, model } => {
                let target = self
                    .providers
                    .get(provider)
                    .ok_or_else(|| LlmError::Other(format!("unknown provider {}", provider)))?;
                let alt = match model {
                    Some(m) => CompletionRequest {
                        model: m.clone(),
                        ..req.clone()
                    },
                    None => req.clone(),
                };
                self.call(target.as_ref(), &alt).await
            }
            FallbackStrategy::DegradedInput { max_chars } => {
                let degraded = degrade(req, *max_chars)
                    .ok_or_else(|| LlmError::Other("no user message to degrade".to_string()))?;
                self.call(self.primary.as_ref(), &degraded).await
            }
            FallbackStrategy::CachedResponse => self
                .cache
                .read()
                .await
                .entries
                .get(key)
                .cloned()
                .ok_or_else(|| LlmError::Other("no cached response".to_string())),
        }
    }

    async fn record(&self, name: &str, success: bool) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(name.to_string()).or_default();
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    pub async fn execute_with_fallback(
        &self,
        req: &CompletionRequest,
    ) -> Result<FallbackOutcome, FallbackError> {
        let key = fingerprint(req);
        let mut attempts = Vec::with_capacity(self.strategies.len() + 1);

        match self.call(self.primary.as_ref(), req).await {
            Ok(response) => {
                self.record(PRIMARY, true).await;
                attempts.push(Attempt {
                    strategy: PRIMARY.to_string(),
                    success: true,
                    error: None,
                });
                self.cache.write().await.insert(key, response.clone());
                return Ok(FallbackOutcome {
                    response,
                    fallback_used: false,
                    strategy: None,
                    attempts,
                });
            }
            Err(e) => {
                tracing::warn!(provider = self.primary.name(), model = %req.model, error = %e, "primary completion failed");
                self.record(PRIMARY, false).await;
                attempts.push(Attempt {
                    strategy: PRIMARY.to_string(),
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }

        for strategy in &self.strategies {
            let name = strategy.name();
            match self.run_strategy(strategy, req, &key).await {
                Ok(response) => {
                    self.record(name, true).await;
                    attempts.push(Attempt {
                        strategy: name.to_string(),
                        success: true,
                        error: None,
                    });
                    if matches!(
                        strategy,
                        FallbackStrategy::AlternateModel { .. }
                            | FallbackStrategy::AlternateProvider { .. }
                    ) {
                        self.cache.write().await.insert(key, response.clone());
                    }
                    tracing::info!(strategy = name, attempts = attempts.len(), "fallback succeeded");
                    return Ok(FallbackOutcome {
                        response,
                        fallback_used: true,
                        strategy: Some(name.to_string()),
                        attempts,
                    });
                }
                Err(e) => {
                    tracing::debug!(strategy = name, error = %e, "fallback strategy failed");
                    self.record(name, false).await;
                    attempts.push(Attempt {
                        strategy: name.to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        tracing::error!(attempts = attempts.len(), "all fallback strategies exhausted");
        Err(FallbackError::Exhausted { attempts })
    }
}
