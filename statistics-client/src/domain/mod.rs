pub mod meter_point;
pub mod naming;
pub mod statistic;

pub use meter_point::MeterPoint;
pub use statistic::{
    check_sequence, Field, Granularity, SequenceError, StatisticsRecord, StreamId, StreamKind,
    StreamMetadata,
};
