//! Health history records and trend summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::ProbeOutcome;
use testfarm_id::ResourceId;

/// One applied probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub resource_id: ResourceId,
    pub observed_at: DateTime<Utc>,
    /// Dispatch sequence of the probe that produced this record.
    pub seq: u64,
    pub outcome: ProbeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub detail: String,
}

/// Aggregate over a window of health records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTrend {
    pub resource_id: ResourceId,
    pub since: DateTime<Utc>,
    pub samples: usize,
    pub ok: usize,
    pub degraded: usize,
    pub unreachable: usize,
    /// Share of samples where the resource answered (ok or degraded).
    pub availability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

impl HealthTrend {
    pub fn from_records<'a>(
        resource_id: ResourceId,
        since: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a HealthRecord>,
    ) -> Self {
        let mut trend = HealthTrend {
            resource_id,
            since,
            samples: 0,
            ok: 0,
            degraded: 0,
            unreachable: 0,
            availability: 0.0,
            avg_latency_ms: None,
        };

        let mut latency_sum = 0u64;
        let mut latency_samples = 0u64;

        for record in records.into_iter().filter(|r| r.observed_at >= since) {
            trend.samples += 1;
            match record.outcome {
                ProbeOutcome::Ok => trend.ok += 1,
                ProbeOutcome::Degraded => trend.degraded += 1,
                ProbeOutcome::Unreachable => trend.unreachable += 1,
            }
            if let Some(latency) = record.latency_ms {
                latency_sum += latency;
                latency_samples += 1;
            }
        }

        if trend.samples > 0 {
            trend.availability = (trend.ok + trend.degraded) as f64 / trend.samples as f64;
        }
        if latency_samples > 0 {
            trend.avg_latency_ms = Some(latency_sum as f64 / latency_samples as f64);
        }

        trend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(secs: i64, outcome: ProbeOutcome, latency_ms: Option<u64>) -> HealthRecord {
        HealthRecord {
            resource_id: ResourceId::parse("H1").unwrap(),
            observed_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            seq: secs as u64,
            outcome,
            latency_ms,
            detail: String::new(),
        }
    }

    #[test]
    fn test_trend_counts_window_only() {
        let records = vec![
            record(0, ProbeOutcome::Unreachable, None),
            record(30, ProbeOutcome::Ok, Some(10)),
            record(60, ProbeOutcome::Degraded, Some(30)),
            record(90, ProbeOutcome::Unreachable, None),
        ];
        let since = records[1].observed_at;

        let trend = HealthTrend::from_records(ResourceId::parse("H1").unwrap(), since, &records);

        assert_eq!(trend.samples, 3);
        assert_eq!((trend.ok, trend.degraded, trend.unreachable), (1, 1, 1));
        assert!((trend.availability - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(trend.avg_latency_ms, Some(20.0));
    }

    #[test]
    fn test_trend_empty() {
        let trend = HealthTrend::from_records(
            ResourceId::parse("H1").unwrap(),
            Utc::now(),
            std::iter::empty(),
        );
        assert_eq!(trend.samples, 0);
        assert_eq!(trend.availability, 0.0);
        assert_eq!(trend.avg_latency_ms, None);
    }
}
