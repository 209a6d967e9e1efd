use serde::Serialize;
use statistics_client::domain::StreamKind;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedStream {
    pub kind: StreamKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MeterStatus {
    Success,
    Partial { skipped: Vec<SkippedStream> },
    Failed { reason: String },
}

impl MeterStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, MeterStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOutcome {
    pub kind: StreamKind,
    pub statistic_id: String,
    pub verdict: &'static str,
    pub written: usize,
    pub repaired: usize,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterReport {
    pub meter_id: String,
    #[serde(flatten)]
    pub status: MeterStatus,
    pub streams: Vec<StreamOutcome>,
    /// Latest running total of the daily consumption stream.
    pub daily_total: Option<f64>,
    /// Consumption of the latest day in that stream.
    pub latest_day: Option<f64>,
}

impl MeterReport {
    pub fn failed(meter_id: &str, reason: String) -> Self {
        Self {
            meter_id: meter_id.to_string(),
            status: MeterStatus::Failed { reason },
            streams: Vec::new(),
            daily_total: None,
            latest_day: None,
        }
    }

    pub fn stream(&self, kind: StreamKind) -> Option<&StreamOutcome> {
        self.streams.iter().find(|s| s.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub meters: Vec<MeterReport>,
}

impl CycleReport {
    pub fn failed_meters(&self) -> usize {
        self.meters.iter().filter(|m| m.status.is_failed()).count()
    }

    pub fn meter(&self, meter_id: &str) -> Option<&MeterReport> {
        self.meters.iter().find(|m| m.meter_id == meter_id)
    }
}

/// Consumption of the latest day: the difference of the two newest running
/// totals, or the latest total when there is no usable previous one.
pub fn latest_day_consumption(latest: f64, previous: Option<f64>) -> f64 {
    match previous {
        Some(prev) if latest - prev >= 0.0 => latest - prev,
        _ => latest,
    }
}
