use anyhow::Result;
use import_service::{
    config::AppConfig,
    importer::Importer,
    metrics_server,
    observability,
    sinks::PgStatisticsSink,
    sources::JsonDirSource,
};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let sink = PgStatisticsSink::connect(pool, cfg.sink.max_retries, cfg.sink.retry_backoff()).await?;
    let source = JsonDirSource::new(&cfg.source.payload_dir);

    let jobs = cfg.meter_jobs();
    let importer = Importer::new(source, sink, cfg.import.settings());
    let interval = cfg.import.cycle_interval();

    tracing::info!(
        meters = jobs.len(),
        interval_minutes = cfg.import.cycle_interval_minutes,
        "starting import scheduler"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let report = importer.run_cycle(&jobs).await;
        if report.failed_meters() > 0 {
            tracing::warn!(failed = report.failed_meters(), "some meters failed, retrying next cycle");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            res = &mut shutdown => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown requested, stopping scheduler");
                break;
            }
        }
    }

    Ok(())
}
