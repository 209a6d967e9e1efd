pub mod statistics_queries;

pub use statistics_queries::MetaColumns;
