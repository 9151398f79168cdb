//! Per-user counters checked against a limit table.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tardis_types::{QuotaError, QuotaStatus};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Counter resets at UTC midnight.
    Daily,
    /// Running total, only lowered by `release`.
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub max: u64,
    pub period: Period,
}

impl Limit {
    pub fn daily(max: u64) -> Self {
        Self {
            max,
            period: Period::Daily,
        }
    }

    pub fn total(max: u64) -> Self {
        Self {
            max,
            period: Period::Total,
        }
    }
}

/// Limit table keyed by resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits(pub BTreeMap<String, Limit>);

impl QuotaLimits {
    pub fn free_tier() -> Self {
        Self(BTreeMap::from([
            ("api_calls".to_string(), Limit::daily(100)),
            ("tokens".to_string(), Limit::daily(50_000)),
            ("storage_mb".to_string(), Limit::total(100)),
            ("incidents".to_string(), Limit::daily(20)),
        ]))
    }

    pub fn with_limit(mut self, resource: impl Into<String>, limit: Limit) -> Self {
        self.0.insert(resource.into(), limit);
        self
    }

    pub fn get(&self, resource: &str) -> Option<Limit> {
        self.0.get(resource).copied()
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::free_tier()
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    date: NaiveDate,
    used: u64,
}

type CounterKey = (String, String);

pub struct QuotaManager {
    limits: QuotaLimits,
    counters: RwLock<HashMap<CounterKey, Counter>>,
}

impl QuotaManager {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    fn limit_for(&self, resource: &str) -> Result<Limit, QuotaError> {
        self.limits
            .get(resource)
            .ok_or_else(|| QuotaError::UnknownResource(resource.to_string()))
    }

    fn current_used(counter: Option<&Counter>, limit: Limit, today: NaiveDate) -> u64 {
        match counter {
            Some(c) if limit.period == Period::Daily && c.date != today => 0,
            Some(c) => c.used,
            None => 0,
        }
    }

    fn status(user_id: &str, resource: &str, used: u64, amount: u64, limit: Limit) -> QuotaStatus {
        QuotaStatus {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            allowed: used.saturating_add(amount) <= limit.max,
            used,
            limit: limit.max,
            remaining: limit.max.saturating_sub(used),
        }
    }

    /// Would `amount` more fit? Does not change counters.
    pub async fn check(
        &self,
        user_id: &str,
        resource: &str,
        amount: u64,
    ) -> Result<QuotaStatus, QuotaError> {
        self.check_at(user_id, resource, amount, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        user_id: &str,
        resource: &str,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<QuotaStatus, QuotaError> {
        let limit = self.limit_for(resource)?;
        let counters = self.counters.read().await;
        let key = (user_id.to_string(), resource.to_string());
        let used = Self::current_used(counters.get(&key), limit, at.date_naive());
        Ok(Self::status(user_id, resource, used, amount, limit))
    }

    /// Add `amount` to the counter, or fail with `Exceeded` leaving it untouched.
    pub async fn consume(
        &self,
        user_id: &str,
        resource: &str,
        amount: u64,
    ) -> Result<QuotaStatus, QuotaError> {
        self.consume_at(user_id, resource, amount, Utc::now()).await
    }

    pub async fn consume_at(
        &self,
        user_id: &str,
        resource: &str,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<QuotaStatus, QuotaError> {
        let limit = self.limit_for(resource)?;
        let today = at.date_naive();
        let mut counters = self.counters.write().await;
        let key = (user_id.to_string(), resource.to_string());
        let used = Self::current_used(counters.get(&key), limit, today);
        let next = used.saturating_add(amount);
        if next > limit.max {
            tracing::info!(user_id = %user_id, resource = %resource, used, amount, limit = limit.max, "quota exceeded");
            return Err(QuotaError::Exceeded {
                resource: resource.to_string(),
                used,
                limit: limit.max,
            });
        }
        counters.insert(key, Counter { date: today, used: next });
        Ok(Self::status(user_id, resource, next, 0, limit))
    }

    /// Lower a counter, e.g. after stored data is deleted. Saturates at zero.
    pub async fn release(
        &self,
        user_id: &str,
        resource: &str,
        amount: u64,
    ) -> Result<QuotaStatus, QuotaError> {
        let limit = self.limit_for(resource)?;
        let today = Utc::now().date_naive();
        let mut counters = self.counters.write().await;
        let key = (user_id.to_string(), resource.to_string());
        let used = Self::current_used(counters.get(&key), limit, today).saturating_sub(amount);
        counters.insert(key, Counter { date: today, used });
        Ok(Self::status(user_id, resource, used, 0, limit))
    }

    /// Status of every configured resource for the user.
    pub async fn usage(&self, user_id: &str) -> Vec<QuotaStatus> {
        self.usage_at(user_id, Utc::now()).await
    }

    pub async fn usage_at(&self, user_id: &str, at: DateTime<Utc>) -> Vec<QuotaStatus> {
        let today = at.date_naive();
        let counters = self.counters.read().await;
        self.limits
            .0
            .iter()
            .map(|(resource, limit)| {
                let key = (user_id.to_string(), resource.clone());
                let used = Self::current_used(counters.get(&key), *limit, today);
                Self::status(user_id, resource, used, 0, *limit)
            })
            .collect()
    }

    /// Drop all counters for the user; returns how many existed.
    pub async fn reset_user(&self, user_id: &str) -> usize {
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|(user, _), _| user != user_id);
        let removed = before - counters.len();
        tracing::info!(user_id = %user_id, removed, "quota counters reset");
        removed
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new(QuotaLimits::free_tier())
    }
}
