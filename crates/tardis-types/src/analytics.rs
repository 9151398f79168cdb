//! Metric/event rows and time-bucket aggregation primitives.

use chrono::{DateTime, Datelike, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub id: String,
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id(),
            name: name.into(),
            value,
            timestamp,
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Width of an aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Minute,
    Hour,
    Day,
    Week,
}

impl TimeBucket {
    /// Start of the bucket containing `ts`. Weeks start Monday 00:00 UTC.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            TimeBucket::Minute => Duration::minutes(1),
            TimeBucket::Hour => Duration::hours(1),
            TimeBucket::Day | TimeBucket::Week => Duration::days(1),
        };
        let day_or_finer = ts.duration_trunc(step).unwrap_or(ts);
        if self != TimeBucket::Week {
            return day_or_finer;
        }
        let back = day_or_finer.weekday().num_days_from_monday() as i64;
        day_or_finer - Duration::days(back)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    /// Fold `values`; `None` for an empty slice.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let v = match self {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => values.len() as f64,
        };
        Some(v)
    }
}

/// Range query over one metric name. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MetricQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, point: &MetricPoint) -> bool {
        if point.name != self.name {
            return false;
        }
        if let Some(start) = self.start {
            if point.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if point.timestamp >= end {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| point.tags.get(k).map(|pv| pv == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketValue {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
    pub count: usize,
}

/// Group points into buckets and fold each one. Output is ascending by bucket.
pub fn aggregate_points(
    points: &[MetricPoint],
    bucket: TimeBucket,
    aggregation: Aggregation,
) -> Vec<BucketValue> {
    let mut groups: std::collections::BTreeMap<DateTime<Utc>, Vec<f64>> = Default::default();
    for p in points {
        groups.entry(bucket.floor(p.timestamp)).or_default().push(p.value);
    }
    groups
        .into_iter()
        .filter_map(|(bucket_start, values)| {
            aggregation.apply(&values).map(|value| BucketValue {
                bucket_start,
                value,
                count: values.len(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, h, m, 17).unwrap()
    }

    #[test]
    fn floors_to_bucket_start() {
        let ts = at(13, 42);
        assert_eq!(TimeBucket::Minute.floor(ts), Utc.with_ymd_and_hms(2024, 3, 6, 13, 42, 0).unwrap());
        assert_eq!(TimeBucket::Hour.floor(ts), Utc.with_ymd_and_hms(2024, 3, 6, 13, 0, 0).unwrap());
        assert_eq!(TimeBucket::Day.floor(ts), Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap());
        // 2024-03-06 is a Wednesday.
        assert_eq!(TimeBucket::Week.floor(ts), Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn aggregates_per_hour() {
        let points = vec![
            MetricPoint::new("latency", 10.0, at(10, 5)),
            MetricPoint::new("latency", 30.0, at(10, 50)),
            MetricPoint::new("latency", 5.0, at(12, 1)),
        ];
        let sums = aggregate_points(&points, TimeBucket::Hour, Aggregation::Sum);
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0].value, 40.0);
        assert_eq!(sums[0].count, 2);
        assert_eq!(sums[1].value, 5.0);

        let avgs = aggregate_points(&points, TimeBucket::Day, Aggregation::Avg);
        assert_eq!(avgs.len(), 1);
        assert_eq!(avgs[0].value, 15.0);

        let max = aggregate_points(&points, TimeBucket::Day, Aggregation::Max);
        assert_eq!(max[0].value, 30.0);
        let min = aggregate_points(&points, TimeBucket::Day, Aggregation::Min);
        assert_eq!(min[0].value, 5.0);
    }

    #[test]
    fn query_range_is_half_open_and_tag_filtered() {
        let p = MetricPoint::new("calls", 1.0, at(10, 0)).with_tag("user_id", "u1");
        let mut q = MetricQuery::named("calls");
        q.start = Some(at(10, 0));
        assert!(q.matches(&p));
        q.end = Some(p.timestamp);
        assert!(!q.matches(&p));
        q.end = None;
        q.tags.insert("user_id".to_string(), "u2".to_string());
        assert!(!q.matches(&p));
    }
}
