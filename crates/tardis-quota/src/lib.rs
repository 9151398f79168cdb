//! Free-tier quotas and usage tracking.

mod manager;
mod tracker;

pub use manager::{Limit, Period, QuotaLimits, QuotaManager};
pub use tardis_types::{QuotaError, QuotaStatus, UsageRecord};
pub use tracker::{UsageTracker, DEFAULT_BUFFER_CAPACITY};
