use anyhow::{bail, Result};
use import_service::{
    config::AppConfig,
    importer::{Importer, MeterJob},
    observability,
    sinks::PgStatisticsSink,
    sources::JsonDirSource,
};
use sqlx::postgres::PgPoolOptions;
use std::env;

/// Runs a single import cycle and prints its report as JSON.
///
/// usage: import_once [meter_id ...]
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let only: Vec<String> = env::args().skip(1).collect();

    let cfg = AppConfig::load()?;

    let jobs: Vec<MeterJob> = cfg
        .meter_jobs()
        .into_iter()
        .filter(|job| only.is_empty() || only.contains(&job.meter.id))
        .collect();
    if jobs.is_empty() {
        bail!("no configured meter matches {only:?}");
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let sink = PgStatisticsSink::connect(pool, cfg.sink.max_retries, cfg.sink.retry_backoff()).await?;
    let source = JsonDirSource::new(&cfg.source.payload_dir);

    let importer = Importer::new(source, sink, cfg.import.settings());
    let report = importer.run_cycle(&jobs).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed_meters() > 0 {
        bail!("{} of {} meters failed", report.failed_meters(), report.meters.len());
    }
    Ok(())
}
