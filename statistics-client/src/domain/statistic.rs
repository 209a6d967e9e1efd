use std::fmt;

use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// The four statistic series derived per meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum StreamKind {
    /// Latest total-counter reading per hour. State only.
    Total,
    /// Running total of movement deltas, hourly.
    CumAbs,
    /// Running total of daily aggregates.
    DailyCons,
    /// The counter value of each day.
    DailyMeterRead,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Total,
        StreamKind::CumAbs,
        StreamKind::DailyCons,
        StreamKind::DailyMeterRead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Total => "total",
            StreamKind::CumAbs => "cum_abs",
            StreamKind::DailyCons => "daily_cons",
            StreamKind::DailyMeterRead => "daily_meter_read",
        }
    }

    /// Suffix appended to the meter's base statistic id.
    pub fn suffix(self) -> &'static str {
        match self {
            StreamKind::Total => "",
            StreamKind::CumAbs => "_cum_abs",
            StreamKind::DailyCons => "_daily_cons",
            StreamKind::DailyMeterRead => "_daily_meter_read",
        }
    }

    /// Label appended to the meter display name in stream metadata.
    pub fn label(self) -> Option<&'static str> {
        match self {
            StreamKind::Total => None,
            StreamKind::CumAbs => Some("cumulative"),
            StreamKind::DailyCons => Some("daily consumption"),
            StreamKind::DailyMeterRead => Some("daily meter read"),
        }
    }

    pub fn granularity(self) -> Granularity {
        match self {
            StreamKind::Total | StreamKind::CumAbs => Granularity::Hourly,
            StreamKind::DailyCons | StreamKind::DailyMeterRead => Granularity::Daily,
        }
    }

    /// Graph-capable streams must populate `mean` and `sum` on every row for
    /// long-term statistics consumers to render them.
    pub fn is_graph_capable(self) -> bool {
        matches!(self, StreamKind::CumAbs | StreamKind::DailyMeterRead)
    }

    /// Gated by a per-meter toggle; `total` and `cum_abs` are always active.
    pub fn is_toggled(self) -> bool {
        matches!(self, StreamKind::DailyCons | StreamKind::DailyMeterRead)
    }

    /// Accumulating streams continue from the previous row's `sum`.
    pub fn accumulates(self) -> bool {
        matches!(self, StreamKind::CumAbs | StreamKind::DailyCons)
    }

    /// Whether rows of this kind follow the point-cumulative policy
    /// (`state == mean == sum`). The `mean` here is the running total at the
    /// row's boundary, not an average over the period.
    pub fn is_point_cumulative(self) -> bool {
        !matches!(self, StreamKind::Total)
    }

    /// Dense streams carry a row at every boundary once started. `total`
    /// only gets a row for the hour of each reading, so holes are normal.
    pub fn is_dense(self) -> bool {
        !matches!(self, StreamKind::Total)
    }

    pub fn required_fields(self) -> &'static [Field] {
        if self.is_graph_capable() {
            &[Field::State, Field::Mean, Field::Sum]
        } else if self.accumulates() {
            &[Field::State, Field::Sum]
        } else {
            &[Field::State]
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Field {
    State,
    Mean,
    Sum,
}

/// Boundary alignment of a stream's `start` timestamps, always in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn unit(self) -> Duration {
        match self {
            Granularity::Hourly => Duration::HOUR,
            Granularity::Daily => Duration::DAY,
        }
    }

    pub fn floor(self, ts: OffsetDateTime) -> OffsetDateTime {
        let utc = ts.to_offset(UtcOffset::UTC);
        match self {
            Granularity::Hourly => {
                let into_hour = Duration::minutes(i64::from(utc.minute()))
                    + Duration::seconds(i64::from(utc.second()))
                    + Duration::nanoseconds(i64::from(utc.nanosecond()));
                utc - into_hour
            }
            Granularity::Daily => utc.replace_time(Time::MIDNIGHT),
        }
    }

    pub fn is_aligned(self, ts: OffsetDateTime) -> bool {
        self.floor(ts) == ts
    }

    /// Number of whole units between two aligned boundaries.
    pub fn units_between(self, from: OffsetDateTime, to: OffsetDateTime) -> i64 {
        let unit = self.unit().whole_seconds();
        (to - from).whole_seconds() / unit
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatisticsRecord {
    #[sqlx(rename = "start_ts")]
    pub start: OffsetDateTime,
    pub state: f64,
    pub mean: Option<f64>,
    pub sum: Option<f64>,
}

impl StatisticsRecord {
    /// A row under the point-cumulative policy: `state`, `mean` and `sum` all
    /// carry the running total at `start`.
    pub fn point_cumulative(start: OffsetDateTime, value: f64) -> Self {
        Self {
            start,
            state: value,
            mean: Some(value),
            sum: Some(value),
        }
    }

    pub fn state_only(start: OffsetDateTime, state: f64) -> Self {
        Self {
            start,
            state,
            mean: None,
            sum: None,
        }
    }

    pub fn has_field(&self, field: Field) -> bool {
        match field {
            Field::State => true,
            Field::Mean => self.mean.is_some(),
            Field::Sum => self.sum.is_some(),
        }
    }

    pub fn has_fields(&self, fields: &[Field]) -> bool {
        fields.iter().all(|f| self.has_field(*f))
    }

    /// Drop fields that were not asked for.
    pub fn restricted_to(mut self, fields: &[Field]) -> Self {
        if !fields.contains(&Field::Mean) {
            self.mean = None;
        }
        if !fields.contains(&Field::Sum) {
            self.sum = None;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamMetadata {
    pub name: String,
    pub unit: String,
    pub has_mean: bool,
    pub has_sum: bool,
}

/// `<namespace>:<key><suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamId(String);

impl StreamId {
    pub fn new(namespace: &str, key: &str, kind: StreamKind) -> Self {
        Self(format!("{namespace}:{key}{}", kind.suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SequenceError {
    #[error("{kind} record at {start} is not aligned to its granularity boundary")]
    Misaligned { kind: StreamKind, start: OffsetDateTime },
    #[error("{kind} record at {start} does not come after {previous}")]
    NotIncreasing {
        kind: StreamKind,
        start: OffsetDateTime,
        previous: OffsetDateTime,
    },
}

/// Rows about to be written must be aligned and strictly increasing.
pub fn check_sequence(kind: StreamKind, records: &[StatisticsRecord]) -> Result<(), SequenceError> {
    let granularity = kind.granularity();
    let mut previous: Option<OffsetDateTime> = None;
    for r in records {
        if !granularity.is_aligned(r.start) {
            return Err(SequenceError::Misaligned { kind, start: r.start });
        }
        if let Some(prev) = previous {
            if r.start <= prev {
                return Err(SequenceError::NotIncreasing {
                    kind,
                    start: r.start,
                    previous: prev,
                });
            }
        }
        previous = Some(r.start);
    }
    Ok(())
}
