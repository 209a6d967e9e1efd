use std::{future::Future, time::Duration};

use sqlx::postgres::PgPool;
use statistics_client::{
    db::{statistics_queries, MetaColumns},
    domain::{Field, StatisticsRecord, StreamId, StreamMetadata},
};

use crate::pipeline::{ImportError, SinkCapabilities, StatisticsSink, WriteMode};

/// Statistics tables over the Postgres wire protocol.
pub struct PgStatisticsSink {
    pool: PgPool,
    columns: MetaColumns,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgStatisticsSink {
    /// Probes which optional metadata columns the schema has.
    pub async fn connect(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> anyhow::Result<Self> {
        let columns = statistics_queries::meta_columns(&pool).await?;
        if !(columns.has_mean && columns.has_sum) {
            tracing::warn!(
                has_mean = columns.has_mean,
                has_sum = columns.has_sum,
                "statistics_meta lacks capability columns, metadata flags will not be stored"
            );
        }
        Ok(Self {
            pool,
            columns,
            max_retries,
            retry_backoff,
        })
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, stream: &StreamId, mut call: F) -> Result<T, ImportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        statistic_id = %stream,
                        op,
                        attempt,
                        "statistics sink call failed, retrying with backoff"
                    );
                    metrics::counter!("statistics_sink_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, statistic_id = %stream, op, "statistics sink call failed, giving up");
                    metrics::counter!("statistics_sink_errors_total").increment(1);
                    return Err(ImportError::Storage(format!("{op} {stream}: {e}")));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StatisticsSink for PgStatisticsSink {
    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities {
            has_mean: self.columns.has_mean,
            has_sum: self.columns.has_sum,
        }
    }

    async fn get_last_records(
        &self,
        stream: &StreamId,
        fields: &[Field],
        limit: usize,
    ) -> Result<Vec<StatisticsRecord>, ImportError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = statistics_queries::last_records(&self.pool, stream.as_str(), limit)
            .await
            .map_err(|e| {
                metrics::counter!("statistics_sink_errors_total").increment(1);
                ImportError::Storage(format!("read {stream}: {e}"))
            })?;
        Ok(rows.into_iter().map(|r| r.restricted_to(fields)).collect())
    }

    async fn get_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>, ImportError> {
        statistics_queries::metadata(&self.pool, stream.as_str(), self.columns)
            .await
            .map_err(|e| ImportError::Storage(format!("read metadata {stream}: {e}")))
    }

    async fn set_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<(), ImportError> {
        self.with_retry("set_metadata", stream, || {
            statistics_queries::upsert_metadata(&self.pool, stream.as_str(), metadata, self.columns)
        })
        .await
    }

    async fn write(
        &self,
        stream: &StreamId,
        records: &[StatisticsRecord],
        mode: WriteMode,
    ) -> Result<(), ImportError> {
        let written = match mode {
            WriteMode::Append => {
                self.with_retry("append", stream, || {
                    statistics_queries::upsert_records(&self.pool, stream.as_str(), records)
                })
                .await?
            }
            WriteMode::OverwriteTail { from } => {
                self.with_retry("overwrite_tail", stream, || {
                    statistics_queries::replace_tail(&self.pool, stream.as_str(), from, records)
                })
                .await?
            }
        };
        tracing::debug!(statistic_id = %stream, written, ?mode, "statistics rows stored");
        Ok(())
    }
}
