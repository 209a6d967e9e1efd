pub mod report;

use std::time::{Instant, SystemTime};

use statistics_client::domain::{Field, Granularity, MeterPoint, StreamKind};
use time::{Duration, OffsetDateTime};

use crate::pipeline::{FetchWindow, ImportError, PayloadSource, StatisticsSink};
use crate::reconcile::{BackfillEngine, ValidityChecker, Verdict, WritePlan};
use crate::transform::{decode, EnabledKinds, SourcePoint, StreamMapper};
use crate::writer::Writer;

pub use report::{latest_day_consumption, CycleReport, MeterReport, MeterStatus, SkippedStream, StreamOutcome};

pub const MAX_HISTORY_DAYS: u32 = 3650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    /// Prefix of every statistic id.
    pub namespace: String,
    pub unit: String,
    /// How far back the first fetch of a meter reaches.
    pub history_days: u32,
    pub tail_lookback: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            namespace: "meter_stats".to_string(),
            unit: "kWh".to_string(),
            history_days: 1095,
            tail_lookback: 5,
        }
    }
}

/// One meter and the streams enabled for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterJob {
    pub meter: MeterPoint,
    pub enabled: EnabledKinds,
}

/// Runs fetch, decode, map, reconcile and write for each meter in turn.
/// Nothing is remembered between cycles; every position comes from the sink.
pub struct Importer<S, K> {
    source: S,
    sink: K,
    settings: ImportSettings,
}

impl<S, K> Importer<S, K>
where
    S: PayloadSource,
    K: StatisticsSink,
{
    pub fn new(source: S, sink: K, settings: ImportSettings) -> Self {
        Self { source, sink, settings }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    pub async fn run_cycle(&self, jobs: &[MeterJob]) -> CycleReport {
        let started_at = OffsetDateTime::now_utc();
        let timer = Instant::now();

        let mut meters = Vec::with_capacity(jobs.len());
        for job in jobs {
            meters.push(self.import_meter(job, started_at).await);
        }

        let elapsed = timer.elapsed();
        metrics::counter!("import_cycles_total").increment(1);
        metrics::histogram!("import_cycle_duration_seconds").record(elapsed.as_secs_f64());

        let report = CycleReport {
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            meters,
        };
        tracing::info!(
            meters = report.meters.len(),
            failed = report.failed_meters(),
            duration_ms = report.duration_ms,
            "import cycle finished"
        );
        report
    }

    /// Never fails: errors end up in the report's status.
    pub async fn import_meter(&self, job: &MeterJob, now: OffsetDateTime) -> MeterReport {
        let meter_id = &job.meter.id;
        match self.try_import_meter(job, now).await {
            Ok(report) => {
                match &report.status {
                    MeterStatus::Partial { skipped } => {
                        tracing::warn!(meter_id = %meter_id, skipped = skipped.len(), "meter imported partially")
                    }
                    _ => tracing::info!(
                        meter_id = %meter_id,
                        written = report.streams.iter().map(|s| s.written).sum::<usize>(),
                        "meter imported"
                    ),
                }
                report
            }
            Err(e) => {
                tracing::error!(meter_id = %meter_id, error = %e, "meter import failed");
                metrics::counter!("import_meter_failures_total").increment(1);
                MeterReport::failed(meter_id, e.to_string())
            }
        }
    }

    /// From the UTC midnight of the oldest cursor of the always-active
    /// streams, or `history_days` back when neither has rows yet.
    pub async fn fetch_window(&self, meter: &MeterPoint, now: OffsetDateTime) -> Result<FetchWindow, ImportError> {
        let mut earliest: Option<OffsetDateTime> = None;
        for kind in StreamKind::ALL.into_iter().filter(|k| !k.is_toggled()) {
            let stream = meter.stream_id(&self.settings.namespace, kind);
            let last = self.sink.get_last_records(&stream, &[Field::State], 1).await?;
            if let Some(r) = last.first() {
                earliest = Some(earliest.map_or(r.start, |e| e.min(r.start)));
            }
        }

        let start = match earliest {
            Some(ts) => Granularity::Daily.floor(ts),
            None => {
                let days = self.settings.history_days.clamp(1, MAX_HISTORY_DAYS);
                Granularity::Daily.floor(now - Duration::days(i64::from(days)))
            }
        };
        Ok(FetchWindow { start, end: now })
    }

    async fn try_import_meter(&self, job: &MeterJob, now: OffsetDateTime) -> Result<MeterReport, ImportError> {
        let meter = &job.meter;
        let window = self.fetch_window(meter, now).await?;

        let envelope = self.source.fetch(meter, window).await?;
        if let Ok(age) = SystemTime::now().duration_since(envelope.received_at) {
            metrics::histogram!("fetch_payload_age_seconds").record(age.as_secs_f64());
        }

        let decoded = decode(&envelope.payload);
        let mapped = StreamMapper::map(&decoded, job.enabled, window.end);

        let mut streams = Vec::new();
        let mut skipped = Vec::new();
        for (kind, points) in mapped {
            let result = match points {
                Ok(points) => self.import_stream(meter, kind, points).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => streams.push(outcome),
                Err(e) => {
                    tracing::warn!(meter_id = %meter.id, stream = %kind, error = %e, "stream skipped this cycle");
                    metrics::counter!("import_streams_skipped_total").increment(1);
                    skipped.push(SkippedStream {
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let (daily_total, latest_day) = if job.enabled.daily_cons {
            match self.daily_summary(meter).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!(meter_id = %meter.id, error = %e, "failed to read daily consumption summary");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let status = if skipped.is_empty() {
            MeterStatus::Success
        } else {
            MeterStatus::Partial { skipped }
        };
        Ok(MeterReport {
            meter_id: meter.id.clone(),
            status,
            streams,
            daily_total,
            latest_day,
        })
    }

    async fn import_stream(
        &self,
        meter: &MeterPoint,
        kind: StreamKind,
        points: Vec<SourcePoint>,
    ) -> Result<StreamOutcome, ImportError> {
        let stream = meter.stream_id(&self.settings.namespace, kind);
        let checker = ValidityChecker::new(self.settings.tail_lookback, self.sink.capabilities());

        let recent = checker.recent_records(&self.sink, &stream, kind).await?;
        let cursor = recent.first().map(|r| r.start);
        let new_points: Vec<SourcePoint> = points
            .into_iter()
            .filter(|p| cursor.map_or(true, |c| p.start > c))
            .collect();

        let assessment = checker.assess(kind, &recent, new_points.first().map(|p| p.start));
        let plan = match &assessment.verdict {
            Verdict::Valid => WritePlan::append(kind, assessment.anchor, &new_points),
            Verdict::Gap { from, to } if kind.is_dense() => {
                tracing::info!(
                    meter_id = %meter.id,
                    statistic_id = %stream,
                    %from,
                    %to,
                    missing = kind.granularity().units_between(*from, *to),
                    "gap in stream history"
                );
                metrics::counter!("import_gaps_detected_total").increment(1);
                BackfillEngine::plan(kind, &assessment, &new_points)
            }
            Verdict::Gap { from, to } => {
                tracing::debug!(meter_id = %meter.id, statistic_id = %stream, %from, %to, "new reading after idle hours");
                BackfillEngine::plan(kind, &assessment, &new_points)
            }
            Verdict::IncompleteTail { tail } => {
                tracing::info!(
                    meter_id = %meter.id,
                    statistic_id = %stream,
                    incomplete = tail.len(),
                    "repairing incomplete rows"
                );
                BackfillEngine::plan(kind, &assessment, &new_points)
            }
        };

        let previous_sum = assessment.cursor.map(|_| assessment.anchor);
        let outcome = Writer::new(&self.sink, &self.settings.unit)
            .write(meter, &stream, &plan, previous_sum)
            .await?;

        Ok(StreamOutcome {
            kind,
            statistic_id: stream.to_string(),
            verdict: assessment.verdict.name(),
            written: outcome.written,
            repaired: outcome.repaired,
            digest: outcome.digest,
        })
    }

    async fn daily_summary(&self, meter: &MeterPoint) -> Result<(Option<f64>, Option<f64>), ImportError> {
        let stream = meter.stream_id(&self.settings.namespace, StreamKind::DailyCons);
        let rows = self
            .sink
            .get_last_records(&stream, &[Field::State, Field::Sum], 2)
            .await?;
        let total = |i: usize| rows.get(i).map(|r| r.sum.unwrap_or(r.state));
        let latest = total(0);
        Ok((latest, latest.map(|l| latest_day_consumption(l, total(1)))))
    }
}
