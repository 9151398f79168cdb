//! Analytics storage: append-only metric and event rows, range queries and
//! bucketed aggregation.

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryAnalyticsStore;
pub use tardis_types::{
    Aggregation, AnalyticsError, AnalyticsEvent, AnalyticsStore, BucketValue, MetricPoint,
    MetricQuery, TimeBucket,
};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAnalyticsStore;
