use std::{collections::HashMap, sync::Mutex};

use import_service::{
    importer::{ImportSettings, Importer, MeterJob, MeterStatus},
    pipeline::{Envelope, FetchWindow, ImportError, PayloadSource},
    sinks::MemoryStatisticsSink,
    transform::{EnabledKinds, RawMeterPayload},
};
use serde_json::{json, Value};
use statistics_client::domain::{MeterPoint, StatisticsRecord, StreamId, StreamKind, StreamMetadata};
use time::{format_description::well_known::Rfc3339, macros::datetime, Duration, OffsetDateTime};

/// Hands out whatever payload the test put in place for a meter.
#[derive(Default)]
struct ScriptedSource {
    payloads: Mutex<HashMap<String, Result<RawMeterPayload, ImportError>>>,
}

impl ScriptedSource {
    fn set(&self, meter_id: &str, payload: Result<RawMeterPayload, ImportError>) {
        self.payloads.lock().unwrap().insert(meter_id.to_string(), payload);
    }
}

#[async_trait::async_trait]
impl PayloadSource for ScriptedSource {
    async fn fetch(&self, meter: &MeterPoint, _window: FetchWindow) -> Result<Envelope<RawMeterPayload>, ImportError> {
        self.payloads
            .lock()
            .unwrap()
            .get(&meter.id)
            .cloned()
            .unwrap_or_else(|| Err(ImportError::Fetch(format!("no payload for {}", meter.id))))
            .map(Envelope::now)
    }
}

fn importer() -> Importer<ScriptedSource, MemoryStatisticsSink> {
    Importer::new(ScriptedSource::default(), MemoryStatisticsSink::new(), ImportSettings::default())
}

fn job(id: &str) -> MeterJob {
    MeterJob {
        meter: MeterPoint::new(id),
        enabled: EnabledKinds::default(),
    }
}

fn stream(id: &str, kind: StreamKind) -> StreamId {
    MeterPoint::new(id).stream_id("meter_stats", kind)
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap()
}

/// Quarter-hour movement points starting at `start`.
fn movement(start: OffsetDateTime, deltas: &[f64]) -> Value {
    let deltas: Vec<Option<f64>> = deltas.iter().copied().map(Some).collect();
    sparse_movement(start, &deltas)
}

/// Like `movement`, with `None` sent as a null (not yet measured) value.
fn sparse_movement(start: OffsetDateTime, deltas: &[Option<f64>]) -> Value {
    let values: Vec<Value> = deltas
        .iter()
        .enumerate()
        .map(|(i, d)| json!({"timestamp": rfc3339(start + Duration::minutes(15 * i as i64)), "value": d}))
        .collect();
    json!({"unit": "KWH", "values": values})
}

fn total(ts: OffsetDateTime, value: f64) -> Value {
    json!({"timestamp": rfc3339(ts), "value": value, "unit": "KWH"})
}

fn full_payload() -> RawMeterPayload {
    RawMeterPayload {
        movement: Some(movement(
            datetime!(2025-01-01 00:00 UTC),
            &[0.25, 0.25, 0.5, 0.5, 0.125, 0.125, 0.25, 0.5, 0.75],
        )),
        daily: Some(json!({"unit": "KWH", "values": [
            {"date": "2025-01-01", "value": 4.0},
            {"date": "2025-01-02", "value": 5.5},
        ]})),
        total: Some(total(datetime!(2025-01-03 06:10 UTC), 510.0)),
        meter_reads: Some(json!({"unit": "KWH", "values": [
            {"timestamp": "2025-01-01T23:00:00Z", "value": 504.0},
            {"timestamp": "2025-01-02T23:00:00Z", "value": 509.5},
        ]})),
    }
}

fn all_rows(importer: &Importer<ScriptedSource, MemoryStatisticsSink>, id: &str) -> Vec<Vec<StatisticsRecord>> {
    StreamKind::ALL
        .iter()
        .map(|k| importer.sink().rows(&stream(id, *k)))
        .collect()
}

#[tokio::test]
async fn new_delta_continues_from_last_sum() {
    let importer = importer();
    importer.sink().seed(
        &stream("AT001", StreamKind::CumAbs),
        vec![StatisticsRecord::point_cumulative(datetime!(2025-01-01 10:00 UTC), 100.0)],
    );
    importer.source().set(
        "AT001",
        Ok(RawMeterPayload {
            movement: Some(movement(datetime!(2025-01-01 11:00 UTC), &[0.5, 0.25, 0.5, 0.25])),
            ..RawMeterPayload::default()
        }),
    );

    let report = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(report.failed_meters(), 0);

    let rows = importer.sink().rows(&stream("AT001", StreamKind::CumAbs));
    assert_eq!(
        rows.last(),
        Some(&StatisticsRecord::point_cumulative(datetime!(2025-01-01 11:00 UTC), 101.5))
    );
}

#[tokio::test]
async fn incomplete_row_is_upgraded_with_metadata() {
    let importer = importer();
    let cum_abs = stream("AT001", StreamKind::CumAbs);
    importer.sink().seed(
        &cum_abs,
        vec![StatisticsRecord::state_only(datetime!(2025-01-01 10:00 UTC), 100.0)],
    );
    importer.sink().seed_metadata(
        &cum_abs,
        StreamMetadata {
            name: "AT001 cumulative".to_string(),
            unit: "kWh".to_string(),
            has_mean: false,
            has_sum: false,
        },
    );
    importer.source().set("AT001", Ok(RawMeterPayload::default()));

    let report = importer.run_cycle(&[job("AT001")]).await;
    let outcome = report.meters[0].stream(StreamKind::CumAbs).unwrap();
    assert_eq!(outcome.verdict, "incomplete_tail");
    assert_eq!(outcome.repaired, 1);

    assert_eq!(
        importer.sink().rows(&cum_abs),
        vec![StatisticsRecord::point_cumulative(datetime!(2025-01-01 10:00 UTC), 100.0)]
    );
    let meta = importer.sink().metadata_of(&cum_abs).unwrap();
    assert!(meta.has_mean && meta.has_sum);
}

#[tokio::test]
async fn re_enabled_stream_resumes_without_filling_the_disabled_period() {
    let importer = importer();
    let reads = stream("AT001", StreamKind::DailyMeterRead);
    importer.sink().seed(
        &reads,
        vec![StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 500.0)],
    );

    let disabled = MeterJob {
        meter: MeterPoint::new("AT001"),
        enabled: EnabledKinds {
            daily_cons: true,
            daily_meter_read: false,
        },
    };
    importer.source().set(
        "AT001",
        Ok(RawMeterPayload {
            daily: Some(json!({"unit": "KWH", "values": [{"date": "2025-01-05", "value": 2.0}]})),
            total: Some(total(datetime!(2025-01-05 08:00 UTC), 510.0)),
            ..RawMeterPayload::default()
        }),
    );
    let report = importer.run_cycle(&[disabled]).await;
    assert!(report.meters[0].stream(StreamKind::DailyMeterRead).is_none());
    assert_eq!(importer.sink().rows(&reads).len(), 1);

    importer.source().set(
        "AT001",
        Ok(RawMeterPayload {
            daily: Some(json!({"unit": "KWH", "values": [{"date": "2025-01-10", "value": 3.0}]})),
            total: Some(total(datetime!(2025-01-10 06:00 UTC), 520.0)),
            ..RawMeterPayload::default()
        }),
    );
    let report = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(report.meters[0].stream(StreamKind::DailyMeterRead).unwrap().verdict, "gap");

    assert_eq!(
        importer.sink().rows(&reads),
        vec![
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 500.0),
            StatisticsRecord::point_cumulative(datetime!(2025-01-10 00:00 UTC), 520.0),
        ]
    );
}

#[tokio::test]
async fn second_run_with_same_payload_changes_nothing() {
    let importer = importer();
    importer.source().set("AT001", Ok(full_payload()));

    let first = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(first.meters[0].status, MeterStatus::Success);
    let after_first = all_rows(&importer, "AT001");
    let writes = importer.sink().write_count();

    let second = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(all_rows(&importer, "AT001"), after_first);
    assert!(second.meters[0].streams.iter().all(|s| s.written == 0));
    assert_eq!(importer.sink().write_count(), writes);
}

#[tokio::test]
async fn full_payload_maps_every_stream() {
    let importer = importer();
    importer.source().set("AT001", Ok(full_payload()));
    let report = importer.run_cycle(&[job("AT001")]).await;

    // The 02:00 hour only has its first quarter and is held back.
    assert_eq!(
        importer.sink().rows(&stream("AT001", StreamKind::CumAbs)),
        vec![
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 1.5),
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 01:00 UTC), 2.5),
        ]
    );
    assert_eq!(
        importer.sink().rows(&stream("AT001", StreamKind::DailyCons)),
        vec![
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 4.0),
            StatisticsRecord::point_cumulative(datetime!(2025-01-02 00:00 UTC), 9.5),
        ]
    );
    assert_eq!(
        importer.sink().rows(&stream("AT001", StreamKind::DailyMeterRead)),
        vec![
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 504.0),
            StatisticsRecord::point_cumulative(datetime!(2025-01-02 00:00 UTC), 509.5),
        ]
    );
    assert_eq!(
        importer.sink().rows(&stream("AT001", StreamKind::Total)),
        vec![StatisticsRecord::state_only(datetime!(2025-01-03 06:00 UTC), 510.0)]
    );

    let meter = &report.meters[0];
    assert_eq!(meter.daily_total, Some(9.5));
    assert_eq!(meter.latest_day, Some(5.5));
}

#[tokio::test]
async fn persisted_sums_never_decrease() {
    let importer = importer();
    importer.source().set("AT001", Ok(full_payload()));
    importer.run_cycle(&[job("AT001")]).await;

    for rows in all_rows(&importer, "AT001") {
        let sums: Vec<f64> = rows.iter().filter_map(|r| r.sum).collect();
        assert!(sums.windows(2).all(|w| w[1] >= w[0]), "{sums:?}");
    }
}

#[tokio::test]
async fn splitting_history_across_cycles_gives_the_same_rows() {
    let deltas = [0.25, 0.25, 0.5, 0.5, 0.125, 0.125, 0.25, 0.5, 0.75, 0.75, 0.25, 0.25];

    let whole = importer();
    whole.source().set(
        "AT001",
        Ok(RawMeterPayload {
            movement: Some(movement(datetime!(2025-01-01 00:00 UTC), &deltas)),
            ..RawMeterPayload::default()
        }),
    );
    whole.run_cycle(&[job("AT001")]).await;

    let split = importer();
    for upto in [4, 8, 12] {
        split.source().set(
            "AT001",
            Ok(RawMeterPayload {
                movement: Some(movement(datetime!(2025-01-01 00:00 UTC), &deltas[..upto])),
                ..RawMeterPayload::default()
            }),
        );
        split.run_cycle(&[job("AT001")]).await;
    }

    let cum_abs = stream("AT001", StreamKind::CumAbs);
    assert_eq!(whole.sink().rows(&cum_abs).len(), 3);
    assert_eq!(split.sink().rows(&cum_abs), whole.sink().rows(&cum_abs));
}

#[tokio::test]
async fn hour_with_pending_quarters_is_written_once_measured() {
    let importer = importer();
    let cum_abs = stream("AT001", StreamKind::CumAbs);

    importer.source().set(
        "AT001",
        Ok(RawMeterPayload {
            movement: Some(sparse_movement(
                datetime!(2025-01-01 10:00 UTC),
                &[Some(0.25), Some(0.25), None, None, None],
            )),
            ..RawMeterPayload::default()
        }),
    );
    importer.run_cycle(&[job("AT001")]).await;
    assert!(importer.sink().rows(&cum_abs).is_empty());

    importer.source().set(
        "AT001",
        Ok(RawMeterPayload {
            movement: Some(movement(datetime!(2025-01-01 10:00 UTC), &[0.25; 8])),
            ..RawMeterPayload::default()
        }),
    );
    let report = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(report.meters[0].stream(StreamKind::CumAbs).unwrap().verdict, "valid");
    assert_eq!(
        importer.sink().rows(&cum_abs),
        vec![
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 10:00 UTC), 1.0),
            StatisticsRecord::point_cumulative(datetime!(2025-01-01 11:00 UTC), 2.0),
        ]
    );
}

#[tokio::test]
async fn failing_meter_does_not_stop_the_others() {
    let importer = importer();
    importer
        .source()
        .set("AT001", Err(ImportError::Fetch("upstream unavailable".to_string())));
    importer.source().set("AT002", Ok(full_payload()));

    let report = importer.run_cycle(&[job("AT001"), job("AT002")]).await;
    assert_eq!(report.failed_meters(), 1);
    assert!(report.meter("AT001").unwrap().status.is_failed());
    assert_eq!(report.meter("AT002").unwrap().status, MeterStatus::Success);

    assert!(all_rows(&importer, "AT001").iter().all(Vec::is_empty));
    assert_eq!(importer.sink().rows(&stream("AT002", StreamKind::CumAbs)).len(), 2);
}

#[tokio::test]
async fn rejected_writes_are_retried_next_cycle() {
    let importer = importer();
    importer.source().set("AT001", Ok(full_payload()));

    importer.sink().reject_writes(true);
    let report = importer.run_cycle(&[job("AT001")]).await;
    match &report.meters[0].status {
        MeterStatus::Partial { skipped } => assert_eq!(skipped.len(), 4),
        other => panic!("expected partial import, got {other:?}"),
    }
    assert!(all_rows(&importer, "AT001").iter().all(Vec::is_empty));

    importer.sink().reject_writes(false);
    let report = importer.run_cycle(&[job("AT001")]).await;
    assert_eq!(report.meters[0].status, MeterStatus::Success);
    assert_eq!(importer.sink().rows(&stream("AT001", StreamKind::CumAbs)).len(), 2);
}

#[tokio::test]
async fn disabled_streams_get_no_rows() {
    let importer = importer();
    importer.source().set("AT001", Ok(full_payload()));
    let only_always_active = MeterJob {
        meter: MeterPoint::new("AT001"),
        enabled: EnabledKinds {
            daily_cons: false,
            daily_meter_read: false,
        },
    };

    let report = importer.run_cycle(&[only_always_active]).await;
    assert_eq!(report.meters[0].streams.len(), 2);
    assert!(importer.sink().rows(&stream("AT001", StreamKind::DailyCons)).is_empty());
    assert!(importer.sink().rows(&stream("AT001", StreamKind::DailyMeterRead)).is_empty());
    assert_eq!(report.meters[0].daily_total, None);
}
