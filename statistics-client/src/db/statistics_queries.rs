use anyhow::Result;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{StatisticsRecord, StreamMetadata};

/// Which optional capability columns exist in `statistics_meta`.
///
/// Older schemas predate `has_mean` / `has_sum`; writes must leave those
/// columns out rather than fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaColumns {
    pub has_mean: bool,
    pub has_sum: bool,
}

pub async fn meta_columns(pool: &PgPool) -> Result<MetaColumns> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT column_name::TEXT
        FROM information_schema.columns
        WHERE table_name = 'statistics_meta'
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(MetaColumns {
        has_mean: columns.iter().any(|c| c == "has_mean"),
        has_sum: columns.iter().any(|c| c == "has_sum"),
    })
}

/// The most recent rows of a stream, newest first.
pub async fn last_records(pool: &PgPool, statistic_id: &str, limit: i64) -> Result<Vec<StatisticsRecord>> {
    let rows = sqlx::query_as::<_, StatisticsRecord>(
        r#"
        SELECT
            start_ts,
            state,
            mean,
            sum
        FROM statistics
        WHERE statistic_id = $1
        ORDER BY start_ts DESC
        LIMIT $2
        "#,
    )
    .bind(statistic_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn metadata(pool: &PgPool, statistic_id: &str, columns: MetaColumns) -> Result<Option<StreamMetadata>> {
    let sql = format!(
        r#"
        SELECT
            name,
            unit,
            {} AS has_mean,
            {} AS has_sum
        FROM statistics_meta
        WHERE statistic_id = $1
        "#,
        if columns.has_mean { "has_mean" } else { "FALSE" },
        if columns.has_sum { "has_sum" } else { "FALSE" },
    );

    let row = sqlx::query_as::<_, StreamMetadata>(&sql)
        .bind(statistic_id)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

pub async fn upsert_metadata(
    pool: &PgPool,
    statistic_id: &str,
    meta: &StreamMetadata,
    columns: MetaColumns,
) -> Result<()> {
    let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO statistics_meta (statistic_id, name, unit");
    if columns.has_mean {
        builder.push(", has_mean");
    }
    if columns.has_sum {
        builder.push(", has_sum");
    }

    builder.push(") VALUES (");
    {
        let mut values = builder.separated(", ");
        values.push_bind(statistic_id).push_bind(&meta.name).push_bind(&meta.unit);
        if columns.has_mean {
            values.push_bind(meta.has_mean);
        }
        if columns.has_sum {
            values.push_bind(meta.has_sum);
        }
    }
    builder.push(") ON CONFLICT (statistic_id) DO UPDATE SET name = EXCLUDED.name, unit = EXCLUDED.unit");
    if columns.has_mean {
        builder.push(", has_mean = EXCLUDED.has_mean");
    }
    if columns.has_sum {
        builder.push(", has_sum = EXCLUDED.has_sum");
    }

    builder.build().execute(pool).await?;
    Ok(())
}

/// Insert rows, replacing any row already stored at the same start.
pub async fn upsert_records<'e, E>(executor: E, statistic_id: &str, records: &[StatisticsRecord]) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    if records.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO statistics (statistic_id, start_ts, state, mean, sum) ");
    builder.push_values(records, |mut b, r| {
        b.push_bind(statistic_id)
            .push_bind(r.start)
            .push_bind(r.state)
            .push_bind(r.mean)
            .push_bind(r.sum);
    });
    builder.push(
        " ON CONFLICT (statistic_id, start_ts) DO UPDATE SET \
         state = EXCLUDED.state, mean = EXCLUDED.mean, sum = EXCLUDED.sum",
    );

    let res = builder.build().execute(executor).await?;
    Ok(res.rows_affected())
}

/// Atomically drop every row at or after `from` and write `records` in their place.
pub async fn replace_tail(
    pool: &PgPool,
    statistic_id: &str,
    from: OffsetDateTime,
    records: &[StatisticsRecord],
) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query("DELETE FROM statistics WHERE statistic_id = $1 AND start_ts >= $2")
        .bind(statistic_id)
        .bind(from)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let written = upsert_records(&mut *tx, statistic_id, records).await?;
    tx.commit().await?;

    tracing::debug!(statistic_id, deleted, written, "replaced statistics tail");
    Ok(written)
}
