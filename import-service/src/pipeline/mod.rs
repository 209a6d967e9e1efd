use std::time::SystemTime;

use statistics_client::domain::{Field, MeterPoint, StatisticsRecord, StreamId, StreamMetadata};
use time::OffsetDateTime;

use crate::transform::RawMeterPayload;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Time range the importer would like the source to cover.
///
/// A hint only: sources may return more or less, the mapper and validity
/// checker decide what is new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

/// Supplies one meter's raw payload per cycle.
#[async_trait::async_trait]
pub trait PayloadSource: Send + Sync {
    async fn fetch(
        &self,
        meter: &MeterPoint,
        window: FetchWindow,
    ) -> Result<Envelope<RawMeterPayload>, ImportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    /// Replace every stored row at or after `from`.
    OverwriteTail { from: OffsetDateTime },
}

/// Optional columns the sink's schema can store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    pub has_mean: bool,
    pub has_sum: bool,
}

impl SinkCapabilities {
    pub const FULL: SinkCapabilities = SinkCapabilities {
        has_mean: true,
        has_sum: true,
    };

    pub fn supports(&self, field: Field) -> bool {
        match field {
            Field::State => true,
            Field::Mean => self.has_mean,
            Field::Sum => self.has_sum,
        }
    }
}

/// Persistent store of statistics streams. The only state that survives a cycle.
#[async_trait::async_trait]
pub trait StatisticsSink: Send + Sync {
    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::FULL
    }

    /// Up to `limit` most recent rows, newest first, with only `fields` populated.
    async fn get_last_records(
        &self,
        stream: &StreamId,
        fields: &[Field],
        limit: usize,
    ) -> Result<Vec<StatisticsRecord>, ImportError>;

    async fn get_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>, ImportError>;

    async fn set_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<(), ImportError>;

    async fn write(
        &self,
        stream: &StreamId,
        records: &[StatisticsRecord],
        mode: WriteMode,
    ) -> Result<(), ImportError>;
}
