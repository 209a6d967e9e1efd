use statistics_client::domain::{StatisticsRecord, StreamKind};

use crate::pipeline::WriteMode;
use crate::reconcile::fingerprint;
use crate::reconcile::validity::{Assessment, Verdict};
use crate::transform::{SourcePoint, SourceValue};

/// Walk `points` in order from `anchor`, producing one row per point.
///
/// Deltas add to the running total, levels replace it. Point-cumulative
/// kinds get `state == mean == sum == running`; `total` gets `state` only.
/// Pure: chaining the last `sum` of one batch into the next yields the same
/// rows as a single call over the concatenation.
pub fn accumulate(kind: StreamKind, anchor: f64, points: &[SourcePoint]) -> Vec<StatisticsRecord> {
    let mut running = anchor;
    points
        .iter()
        .map(|p| {
            running = match p.value {
                SourceValue::Delta(d) => running + d,
                SourceValue::Level(v) => v,
            };
            if kind.is_point_cumulative() {
                StatisticsRecord::point_cumulative(p.start, running)
            } else {
                StatisticsRecord::state_only(p.start, running)
            }
        })
        .collect()
}

/// Number of rows whose `sum` is lower than the one before it, starting from
/// `previous`. Counter resets show up here; they are reported, not corrected.
pub fn sum_decreases(previous: Option<f64>, records: &[StatisticsRecord]) -> usize {
    let mut last = previous;
    let mut count = 0;
    for sum in records.iter().filter_map(|r| r.sum) {
        if matches!(last, Some(prev) if sum < prev) {
            count += 1;
        }
        last = Some(sum);
    }
    count
}

/// Rows to write to one stream and how.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub kind: StreamKind,
    pub records: Vec<StatisticsRecord>,
    pub mode: WriteMode,
    /// Leading rows of `records` that rewrite already stored rows.
    pub repaired: usize,
}

impl WritePlan {
    pub fn append(kind: StreamKind, anchor: f64, points: &[SourcePoint]) -> Self {
        Self {
            kind,
            records: accumulate(kind, anchor, points),
            mode: WriteMode::Append,
            repaired: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn appended(&self) -> usize {
        self.records.len() - self.repaired
    }

    pub fn digest(&self) -> String {
        fingerprint(&self.records)
    }
}

/// Recomputes the invalid tail of a stream together with its new rows.
pub struct BackfillEngine;

impl BackfillEngine {
    pub fn plan(kind: StreamKind, assessment: &Assessment, new_points: &[SourcePoint]) -> WritePlan {
        match &assessment.verdict {
            Verdict::Valid => WritePlan::append(kind, assessment.anchor, new_points),
            Verdict::Gap { from, to } => {
                // Missing boundaries stay missing; only real source points are written.
                tracing::debug!(%kind, %from, %to, "continuing across gap without synthesising rows");
                WritePlan::append(kind, assessment.anchor, new_points)
            }
            Verdict::IncompleteTail { tail } => {
                let Some(first) = tail.first() else {
                    return WritePlan::append(kind, assessment.anchor, new_points);
                };
                let points: Vec<SourcePoint> = tail
                    .iter()
                    .map(|row| Self::repair_point(kind, row))
                    .chain(new_points.iter().copied())
                    .collect();
                WritePlan {
                    kind,
                    records: accumulate(kind, assessment.anchor, &points),
                    mode: WriteMode::OverwriteTail { from: first.start },
                    repaired: tail.len(),
                }
            }
        }
    }

    /// The source value an incomplete stored row is rebuilt from.
    pub fn repair_point(kind: StreamKind, row: &StatisticsRecord) -> SourcePoint {
        let value = match kind {
            StreamKind::CumAbs => SourceValue::Level(row.sum.unwrap_or(row.state)),
            // Legacy rows stored the day's consumption in `state` and the
            // running total in `sum`.
            StreamKind::DailyCons => match row.sum {
                Some(sum) => SourceValue::Level(sum),
                None => SourceValue::Delta(row.state),
            },
            StreamKind::DailyMeterRead | StreamKind::Total => SourceValue::Level(row.state),
        };
        SourcePoint {
            start: row.start,
            value,
        }
    }
}
