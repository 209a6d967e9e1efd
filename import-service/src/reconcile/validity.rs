use statistics_client::domain::{Field, StatisticsRecord, StreamId, StreamKind};
use time::OffsetDateTime;

use crate::pipeline::{ImportError, SinkCapabilities, StatisticsSink};

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid,
    /// Stored rows missing a required field, oldest first.
    IncompleteTail { tail: Vec<StatisticsRecord> },
    /// Boundaries `from..to` (exclusive) have no rows and no source data.
    Gap { from: OffsetDateTime, to: OffsetDateTime },
}

impl Verdict {
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::IncompleteTail { .. } => "incomplete_tail",
            Verdict::Gap { .. } => "gap",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    /// Running total the next row continues from.
    pub anchor: f64,
    /// Start of the most recent stored row.
    pub cursor: Option<OffsetDateTime>,
}

impl Assessment {
    /// Only candidates strictly after the cursor are new.
    pub fn is_new(&self, start: OffsetDateTime) -> bool {
        self.cursor.map_or(true, |c| start > c)
    }
}

pub struct ValidityChecker {
    lookback: usize,
    capabilities: SinkCapabilities,
}

impl ValidityChecker {
    pub fn new(lookback: usize, capabilities: SinkCapabilities) -> Self {
        Self {
            lookback: lookback.max(1),
            capabilities,
        }
    }

    /// Required fields of `kind` that the sink can actually store.
    pub fn required_fields(&self, kind: StreamKind) -> Vec<Field> {
        kind.required_fields()
            .iter()
            .copied()
            .filter(|f| self.capabilities.supports(*f))
            .collect()
    }

    pub fn is_complete(&self, kind: StreamKind, row: &StatisticsRecord) -> bool {
        if !row.has_fields(&self.required_fields(kind)) {
            return false;
        }
        // Legacy daily_cons rows kept the day's delta in `state`.
        kind != StreamKind::DailyCons || row.sum.map_or(true, |sum| sum == row.state)
    }

    /// Most recent rows, newest first. Starts at the configured lookback and
    /// doubles while every fetched row is incomplete and history remains.
    pub async fn recent_records<S>(
        &self,
        sink: &S,
        stream: &StreamId,
        kind: StreamKind,
    ) -> Result<Vec<StatisticsRecord>, ImportError>
    where
        S: StatisticsSink + ?Sized,
    {
        let fields: Vec<Field> = [Field::State, Field::Mean, Field::Sum]
            .into_iter()
            .filter(|f| self.capabilities.supports(*f))
            .collect();

        let mut limit = self.lookback;
        loop {
            let rows = sink.get_last_records(stream, &fields, limit).await?;
            let exhausted = rows.len() < limit;
            if exhausted || rows.iter().any(|r| self.is_complete(kind, r)) {
                return Ok(rows);
            }
            tracing::debug!(statistic_id = %stream, limit, "whole lookback incomplete, widening");
            limit = limit.saturating_mul(2);
        }
    }

    /// Classify a stream from its recent rows (newest first) and the earliest
    /// new candidate.
    pub fn assess(
        &self,
        kind: StreamKind,
        recent: &[StatisticsRecord],
        earliest_new: Option<OffsetDateTime>,
    ) -> Assessment {
        let cursor = recent.first().map(|r| r.start);
        let incomplete = recent
            .iter()
            .take_while(|r| !self.is_complete(kind, r))
            .count();
        let anchor = recent
            .get(incomplete)
            .map(|r| r.sum.unwrap_or(r.state))
            .unwrap_or(0.0);

        if incomplete > 0 {
            let tail = recent[..incomplete].iter().rev().cloned().collect();
            return Assessment {
                verdict: Verdict::IncompleteTail { tail },
                anchor,
                cursor,
            };
        }

        let verdict = match (cursor, earliest_new) {
            (Some(last), Some(earliest)) => {
                let expected = last + kind.granularity().unit();
                if earliest > expected {
                    Verdict::Gap {
                        from: expected,
                        to: earliest,
                    }
                } else {
                    Verdict::Valid
                }
            }
            _ => Verdict::Valid,
        };
        Assessment {
            verdict,
            anchor,
            cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemoryStatisticsSink;
    use statistics_client::domain::Granularity;
    use time::macros::datetime;

    fn hourly(start: OffsetDateTime, n: usize, value: f64) -> Vec<StatisticsRecord> {
        (0..n)
            .map(|i| StatisticsRecord::point_cumulative(start + Granularity::Hourly.unit() * i as u32, value))
            .collect()
    }

    fn bare(start: OffsetDateTime, state: f64) -> StatisticsRecord {
        StatisticsRecord::state_only(start, state)
    }

    #[test]
    fn complete_tail_is_valid_and_anchors_on_last_sum() {
        let checker = ValidityChecker::new(5, SinkCapabilities::FULL);
        let recent = vec![StatisticsRecord::point_cumulative(datetime!(2025-01-01 10:00 UTC), 100.0)];
        let a = checker.assess(StreamKind::CumAbs, &recent, Some(datetime!(2025-01-01 11:00 UTC)));
        assert_eq!(a.verdict, Verdict::Valid);
        assert_eq!(a.anchor, 100.0);
        assert!(a.is_new(datetime!(2025-01-01 11:00 UTC)));
        assert!(!a.is_new(datetime!(2025-01-01 10:00 UTC)));
    }

    #[test]
    fn empty_stream_anchors_at_zero() {
        let checker = ValidityChecker::new(5, SinkCapabilities::FULL);
        let a = checker.assess(StreamKind::DailyCons, &[], Some(datetime!(2025-01-01 00:00 UTC)));
        assert_eq!(a.verdict, Verdict::Valid);
        assert_eq!(a.anchor, 0.0);
        assert_eq!(a.cursor, None);
    }

    #[test]
    fn missing_mean_and_sum_flags_the_tail() {
        let checker = ValidityChecker::new(5, SinkCapabilities::FULL);
        let recent = vec![bare(datetime!(2025-01-01 10:00 UTC), 100.0)];
        let a = checker.assess(StreamKind::CumAbs, &recent, None);
        assert_eq!(
            a.verdict,
            Verdict::IncompleteTail {
                tail: vec![bare(datetime!(2025-01-01 10:00 UTC), 100.0)]
            }
        );
        assert_eq!(a.anchor, 0.0);
    }

    #[test]
    fn flagged_tail_covers_exactly_the_incomplete_rows() {
        let checker = ValidityChecker::new(10, SinkCapabilities::FULL);
        for k in 1..=4 {
            // newest first: k incomplete rows, then complete history
            let mut recent: Vec<StatisticsRecord> = (0..k)
                .map(|i| bare(datetime!(2025-01-01 20:00 UTC) - Granularity::Hourly.unit() * i as u32, 50.0))
                .collect();
            let mut history = hourly(datetime!(2025-01-01 10:00 UTC), 3, 42.0);
            history.reverse();
            recent.extend(history);

            let a = checker.assess(StreamKind::CumAbs, &recent, None);
            match a.verdict {
                Verdict::IncompleteTail { tail } => {
                    assert_eq!(tail.len(), k);
                    assert!(tail.windows(2).all(|w| w[0].start < w[1].start));
                }
                other => panic!("expected incomplete tail, got {other:?}"),
            }
            assert_eq!(a.anchor, 42.0);
        }
    }

    #[test]
    fn gap_covers_exactly_the_missing_boundaries() {
        let checker = ValidityChecker::new(5, SinkCapabilities::FULL);
        let recent = vec![StatisticsRecord::point_cumulative(datetime!(2025-01-01 10:00 UTC), 7.0)];
        for k in 1..=3u32 {
            let earliest = datetime!(2025-01-01 11:00 UTC) + Granularity::Hourly.unit() * k;
            let a = checker.assess(StreamKind::CumAbs, &recent, Some(earliest));
            match a.verdict {
                Verdict::Gap { from, to } => {
                    assert_eq!(from, datetime!(2025-01-01 11:00 UTC));
                    assert_eq!(Granularity::Hourly.units_between(from, to), i64::from(k));
                }
                other => panic!("expected gap, got {other:?}"),
            }
        }
    }

    #[test]
    fn legacy_daily_cons_rows_are_incomplete() {
        let checker = ValidityChecker::new(5, SinkCapabilities::FULL);
        let legacy = StatisticsRecord {
            start: datetime!(2025-01-02 00:00 UTC),
            state: 4.0,
            mean: Some(4.0),
            sum: Some(40.0),
        };
        assert!(!checker.is_complete(StreamKind::DailyCons, &legacy));
        let current = StatisticsRecord::point_cumulative(datetime!(2025-01-02 00:00 UTC), 40.0);
        assert!(checker.is_complete(StreamKind::DailyCons, &current));
    }

    #[test]
    fn unsupported_fields_are_not_required() {
        let checker = ValidityChecker::new(
            5,
            SinkCapabilities {
                has_mean: false,
                has_sum: true,
            },
        );
        assert_eq!(checker.required_fields(StreamKind::CumAbs), vec![Field::State, Field::Sum]);
        let row = StatisticsRecord {
            mean: None,
            ..StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 1.0)
        };
        assert!(checker.is_complete(StreamKind::CumAbs, &row));
    }

    #[tokio::test]
    async fn lookback_widens_until_a_complete_row_is_found() {
        let sink = MemoryStatisticsSink::new();
        let stream = StreamId::new("meter_stats", "at001", StreamKind::CumAbs);
        let mut rows = hourly(datetime!(2025-01-01 00:00 UTC), 2, 10.0);
        rows.extend((2..9u32).map(|i| bare(datetime!(2025-01-01 00:00 UTC) + Granularity::Hourly.unit() * i, 11.0)));
        sink.seed(&stream, rows);

        let checker = ValidityChecker::new(2, SinkCapabilities::FULL);
        let recent = checker.recent_records(&sink, &stream, StreamKind::CumAbs).await.unwrap();
        assert_eq!(recent.len(), 8);

        let a = checker.assess(StreamKind::CumAbs, &recent, None);
        match a.verdict {
            Verdict::IncompleteTail { tail } => {
                assert_eq!(tail.len(), 7);
                assert_eq!(tail[0].start, datetime!(2025-01-01 02:00 UTC));
            }
            other => panic!("expected incomplete tail, got {other:?}"),
        }
        assert_eq!(a.anchor, 10.0);
    }
}
