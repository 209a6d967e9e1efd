use serde_json::Value;
use time::{macros::datetime, macros::format_description, Date, Duration, OffsetDateTime};

use crate::pipeline::ImportError;

/// Length of a movement point when the source does not say when it ends.
pub const DEFAULT_MOVEMENT_INTERVAL: Duration = Duration::minutes(15);

/// A meter's payload as fetched: sections are kept loosely shaped until
/// [`decode`] checks them one by one.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RawMeterPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_reads: Option<Value>,
}

impl RawMeterPayload {
    /// The document must be a JSON object of sections; unknown sections are ignored.
    pub fn from_json_str(s: &str) -> Result<Self, ImportError> {
        let doc: Value =
            serde_json::from_str(s).map_err(|e| ImportError::Validation(format!("malformed payload document: {e}")))?;
        if !doc.is_object() {
            return Err(ImportError::Validation(
                "payload document must be a JSON object of sections".to_string(),
            ));
        }
        serde_json::from_value(doc).map_err(|e| ImportError::Validation(format!("malformed payload document: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovementPoint {
    pub timestamp: OffsetDateTime,
    pub until: Option<OffsetDateTime>,
    /// kWh; `None` while the value is not yet measured.
    pub delta: Option<f64>,
    pub estimated: bool,
}

impl MovementPoint {
    pub fn end(&self) -> OffsetDateTime {
        self.until.unwrap_or(self.timestamp + DEFAULT_MOVEMENT_INTERVAL)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyPoint {
    pub date: Date,
    /// kWh consumed that day.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub timestamp: OffsetDateTime,
    /// Counter value in kWh.
    pub value: f64,
}

/// Per-section decode results. `Ok(None)` means the section was absent.
#[derive(Debug, Clone)]
pub struct DecodedPayload {
    pub movement: Result<Option<Vec<MovementPoint>>, ImportError>,
    pub daily: Result<Option<Vec<DailyPoint>>, ImportError>,
    pub total: Result<Option<MeterReading>, ImportError>,
    pub meter_reads: Result<Option<Vec<MeterReading>>, ImportError>,
}

#[derive(serde::Deserialize)]
struct WireSeries {
    unit: Option<String>,
    #[serde(default)]
    values: Vec<Value>,
}

#[derive(serde::Deserialize)]
struct WireMovementPoint {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    until: Option<OffsetDateTime>,
    value: Option<f64>,
    #[serde(default)]
    estimated: bool,
}

#[derive(serde::Deserialize)]
struct WireDailyPoint {
    date: String,
    value: Option<f64>,
}

#[derive(serde::Deserialize)]
struct WireReading {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    value: f64,
}

#[derive(serde::Deserialize)]
struct WireTotal {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    value: f64,
    unit: Option<String>,
}

pub fn decode(raw: &RawMeterPayload) -> DecodedPayload {
    DecodedPayload {
        movement: raw.movement.as_ref().map(decode_movement).transpose(),
        daily: raw.daily.as_ref().map(decode_daily).transpose(),
        total: raw.total.as_ref().map(decode_total).transpose(),
        meter_reads: raw.meter_reads.as_ref().map(decode_meter_reads).transpose(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyUnit {
    Wh,
    KWh,
}

impl EnergyUnit {
    pub fn parse(unit: &str) -> Result<Self, ImportError> {
        match unit.to_ascii_uppercase().as_str() {
            "WH" => Ok(EnergyUnit::Wh),
            "KWH" => Ok(EnergyUnit::KWh),
            other => Err(ImportError::Validation(format!("unsupported unit '{other}'"))),
        }
    }

    pub fn to_kwh(self, value: f64) -> f64 {
        match self {
            EnergyUnit::Wh => value / 1000.0,
            EnergyUnit::KWh => value,
        }
    }
}

fn invalid(section: &str, msg: impl std::fmt::Display) -> ImportError {
    ImportError::Validation(format!("{section}: {msg}"))
}

fn check_ts(section: &str, ts: OffsetDateTime) -> Result<(), ImportError> {
    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if ts < min_ts || ts > max_ts {
        return Err(invalid(section, format!("timestamp {ts} out of allowed range")));
    }
    Ok(())
}

fn check_non_negative(section: &str, value: f64) -> Result<(), ImportError> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(section, format!("value {value} must be a non-negative number")));
    }
    Ok(())
}

/// Parse the series envelope, then convert each value with the series unit.
fn decode_series<W, T>(
    section: &str,
    raw: &Value,
    convert: impl Fn(W, EnergyUnit) -> Result<T, ImportError>,
) -> Result<Vec<T>, ImportError>
where
    W: serde::de::DeserializeOwned,
{
    let series: WireSeries = serde_json::from_value(raw.clone()).map_err(|e| invalid(section, e))?;
    if series.values.is_empty() {
        return Ok(Vec::new());
    }

    let unit = series
        .unit
        .ok_or_else(|| invalid(section, "non-empty values without unit"))?;
    let unit = EnergyUnit::parse(&unit)?;

    series
        .values
        .into_iter()
        .enumerate()
        .map(|(idx, v)| {
            let wire: W = serde_json::from_value(v).map_err(|e| invalid(section, format!("value {idx}: {e}")))?;
            convert(wire, unit)
        })
        .collect()
}

fn ensure_increasing<T, K: PartialOrd + std::fmt::Display>(
    section: &str,
    items: &[T],
    key: impl Fn(&T) -> K,
) -> Result<(), ImportError> {
    for pair in items.windows(2) {
        let (prev, next) = (key(&pair[0]), key(&pair[1]));
        if next <= prev {
            return Err(invalid(section, format!("timestamps out of order: {next} after {prev}")));
        }
    }
    Ok(())
}

fn decode_movement(raw: &Value) -> Result<Vec<MovementPoint>, ImportError> {
    const SECTION: &str = "movement";
    let points = decode_series(SECTION, raw, |w: WireMovementPoint, unit| {
        check_ts(SECTION, w.timestamp)?;
        if let Some(until) = w.until {
            if until <= w.timestamp {
                return Err(invalid(SECTION, format!("interval ending {until} before it starts")));
            }
        }
        let delta = w.value.map(|v| unit.to_kwh(v));
        if let Some(d) = delta {
            check_non_negative(SECTION, d)?;
        }
        Ok(MovementPoint {
            timestamp: w.timestamp,
            until: w.until,
            delta,
            estimated: w.estimated,
        })
    })?;
    ensure_increasing(SECTION, &points, |p| p.timestamp)?;
    Ok(points)
}

fn decode_daily(raw: &Value) -> Result<Vec<DailyPoint>, ImportError> {
    const SECTION: &str = "daily";
    let format = format_description!("[year]-[month]-[day]");
    let points = decode_series(SECTION, raw, |w: WireDailyPoint, unit| {
        let date = Date::parse(&w.date, format)
            .map_err(|e| invalid(SECTION, format!("invalid date '{}': {e}", w.date)))?;
        check_ts(SECTION, date.midnight().assume_utc())?;
        let value = w.value.map(|v| unit.to_kwh(v));
        if let Some(v) = value {
            check_non_negative(SECTION, v)?;
        }
        Ok(DailyPoint { date, value })
    })?;
    ensure_increasing(SECTION, &points, |p| p.date)?;
    Ok(points)
}

fn decode_meter_reads(raw: &Value) -> Result<Vec<MeterReading>, ImportError> {
    const SECTION: &str = "meter_reads";
    let reads = decode_series(SECTION, raw, |w: WireReading, unit| {
        check_ts(SECTION, w.timestamp)?;
        let value = unit.to_kwh(w.value);
        check_non_negative(SECTION, value)?;
        Ok(MeterReading {
            timestamp: w.timestamp,
            value,
        })
    })?;
    ensure_increasing(SECTION, &reads, |r| r.timestamp)?;
    Ok(reads)
}

fn decode_total(raw: &Value) -> Result<MeterReading, ImportError> {
    const SECTION: &str = "total";
    let wire: WireTotal = serde_json::from_value(raw.clone()).map_err(|e| invalid(SECTION, e))?;
    let unit = wire.unit.ok_or_else(|| invalid(SECTION, "reading without unit"))?;
    let value = EnergyUnit::parse(&unit)?.to_kwh(wire.value);
    check_ts(SECTION, wire.timestamp)?;
    check_non_negative(SECTION, value)?;
    Ok(MeterReading {
        timestamp: wire.timestamp,
        value,
    })
}
