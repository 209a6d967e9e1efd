use std::collections::BTreeMap;

use statistics_client::domain::{Granularity, StatisticsRecord, StreamKind};
use time::{Date, OffsetDateTime};

use crate::pipeline::ImportError;
use crate::reconcile::backfill;
use crate::transform::decode::{DailyPoint, DecodedPayload, MeterReading, MovementPoint};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceValue {
    /// Added to the running total.
    Delta(f64),
    /// Replaces the running total.
    Level(f64),
}

/// One boundary-aligned input to a stream, before an anchor is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePoint {
    pub start: OffsetDateTime,
    pub value: SourceValue,
}

/// Per-meter toggle state. `total` and `cum_abs` are always enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledKinds {
    pub daily_cons: bool,
    pub daily_meter_read: bool,
}

impl Default for EnabledKinds {
    fn default() -> Self {
        Self {
            daily_cons: true,
            daily_meter_read: true,
        }
    }
}

impl EnabledKinds {
    pub fn contains(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Total | StreamKind::CumAbs => true,
            StreamKind::DailyCons => self.daily_cons,
            StreamKind::DailyMeterRead => self.daily_meter_read,
        }
    }

    pub fn kinds(self) -> impl Iterator<Item = StreamKind> {
        StreamKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

pub type MappedStreams = BTreeMap<StreamKind, Result<Vec<SourcePoint>, ImportError>>;

/// Turns a decoded payload into ordered source points per enabled stream.
pub struct StreamMapper;

impl StreamMapper {
    /// Disabled kinds are left out entirely. A kind whose source section is
    /// absent maps to an empty list; an invalid section carries its error.
    /// Daily points are only mapped for days that ended by `until`.
    pub fn map(payload: &DecodedPayload, enabled: EnabledKinds, until: OffsetDateTime) -> MappedStreams {
        enabled
            .kinds()
            .map(|kind| {
                let points = match kind {
                    StreamKind::Total => total_points(&payload.total),
                    StreamKind::CumAbs => cum_abs_points(&payload.movement),
                    StreamKind::DailyCons => daily_cons_points(&payload.daily, until),
                    StreamKind::DailyMeterRead => {
                        daily_meter_read_points(&payload.daily, &payload.meter_reads, &payload.total, until)
                    }
                };
                (kind, points)
            })
            .collect()
    }

    /// Candidate records for `points` continuing from `anchor`.
    pub fn candidates(kind: StreamKind, anchor: f64, points: &[SourcePoint]) -> Vec<StatisticsRecord> {
        backfill::accumulate(kind, anchor, points)
    }
}

fn day_start(date: Date) -> OffsetDateTime {
    date.midnight().assume_utc()
}

fn total_points(total: &Result<Option<MeterReading>, ImportError>) -> Result<Vec<SourcePoint>, ImportError> {
    let Some(reading) = total.clone()? else {
        return Ok(Vec::new());
    };
    Ok(vec![SourcePoint {
        start: Granularity::Hourly.floor(reading.timestamp),
        value: SourceValue::Level(reading.value),
    }])
}

#[derive(Default)]
struct HourBucket {
    total: f64,
    unmeasured: bool,
    covered: bool,
}

/// Movement points summed per hour. An hour is finished once a measured
/// point reaches its end and none of its points is still unmeasured. The
/// first unfinished hour and every hour after it are held back, so the
/// running total never skips a partial hour.
fn cum_abs_points(movement: &Result<Option<Vec<MovementPoint>>, ImportError>) -> Result<Vec<SourcePoint>, ImportError> {
    let Some(points) = movement.as_ref().map_err(Clone::clone)? else {
        return Ok(Vec::new());
    };

    let mut buckets: BTreeMap<OffsetDateTime, HourBucket> = BTreeMap::new();
    for p in points {
        let start = Granularity::Hourly.floor(p.timestamp);
        let bucket = buckets.entry(start).or_default();
        if p.estimated {
            tracing::debug!(ts = %p.timestamp, delta = ?p.delta, "estimated movement value");
        }
        match p.delta {
            Some(delta) => {
                bucket.total += delta;
                if p.end() >= start + Granularity::Hourly.unit() {
                    bucket.covered = true;
                }
            }
            None => bucket.unmeasured = true,
        }
    }

    Ok(buckets
        .into_iter()
        .take_while(|(_, b)| b.covered && !b.unmeasured)
        .map(|(start, b)| SourcePoint {
            start,
            value: SourceValue::Delta(b.total),
        })
        .collect())
}

/// A day is finished once its UTC midnight end is not after `until`.
fn day_finished(date: Date, until: OffsetDateTime) -> bool {
    day_start(date) + Granularity::Daily.unit() <= until
}

fn daily_cons_points(
    daily: &Result<Option<Vec<DailyPoint>>, ImportError>,
    until: OffsetDateTime,
) -> Result<Vec<SourcePoint>, ImportError> {
    let Some(points) = daily.as_ref().map_err(Clone::clone)? else {
        return Ok(Vec::new());
    };
    Ok(points
        .iter()
        .filter(|p| day_finished(p.date, until))
        .filter_map(|p| {
            p.value.map(|v| SourcePoint {
                start: day_start(p.date),
                value: SourceValue::Delta(v),
            })
        })
        .collect())
}

/// One level per finished daily point: the latest meter read of that UTC
/// day, or the total reading when it was taken that day.
fn daily_meter_read_points(
    daily: &Result<Option<Vec<DailyPoint>>, ImportError>,
    meter_reads: &Result<Option<Vec<MeterReading>>, ImportError>,
    total: &Result<Option<MeterReading>, ImportError>,
    until: OffsetDateTime,
) -> Result<Vec<SourcePoint>, ImportError> {
    let Some(days) = daily.as_ref().map_err(Clone::clone)? else {
        return Ok(Vec::new());
    };
    let reads = meter_reads.as_ref().map_err(Clone::clone)?;
    let total = total.as_ref().map_err(Clone::clone)?;

    let mut by_day: BTreeMap<Date, &MeterReading> = BTreeMap::new();
    for r in reads.iter().flat_map(|v| v.iter()) {
        // Reads are strictly increasing, so the last one per day wins.
        by_day.insert(Granularity::Daily.floor(r.timestamp).date(), r);
    }

    Ok(days
        .iter()
        .filter(|p| day_finished(p.date, until))
        .filter_map(|p| {
            let reading = by_day.get(&p.date).copied().or_else(|| {
                total
                    .as_ref()
                    .filter(|t| Granularity::Daily.floor(t.timestamp).date() == p.date)
            })?;
            Some(SourcePoint {
                start: day_start(p.date),
                value: SourceValue::Level(reading.value),
            })
        })
        .collect())
}
