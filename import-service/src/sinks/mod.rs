pub mod memory;
pub mod postgres;

pub use memory::MemoryStatisticsSink;
pub use postgres::PgStatisticsSink;
