use anyhow::Result;
use std::sync::Arc;

mod cli;
mod daily_metrics;
mod dim_time;
mod dim_wallet;
mod fact_transactions;
mod jobs;
mod metrics;
mod quality_checks;
mod scheduler;
mod staging;
mod zone_metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("pipeline", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // One-shot commands use the sync Database and exit.
    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    match cmd {
        cli::Command::Run => {}
        cli::Command::Once { force } => {
            let db = common::db::AsyncDb::open(&config.database.path).await?;
            let summary = jobs::run_pipeline_once(&db, &config, force).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        other => {
            let mut db = common::db::Database::open(&config.database.path)?;
            db.run_migrations()?;
            cli::run_command(&mut db, &config, other)?;
            return Ok(());
        }
    }

    tracing::info!("chain analytics pipeline starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    // Dedicated background thread for SQLite.
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let cfg = Arc::new(config);

    let (pipeline_tx, mut pipeline_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (zone_metrics_tx, mut zone_metrics_rx) = tokio::sync::mpsc::channel::<()>(8);

    let scheduler_jobs = vec![
        scheduler::JobSpec {
            name: "pipeline".to_string(),
            interval: std::time::Duration::from_secs(cfg.schedule.pipeline_interval_secs),
            tick: pipeline_tx,
            run_immediately: cfg.schedule.run_immediately,
        },
        scheduler::JobSpec {
            name: "zone_metrics".to_string(),
            interval: std::time::Duration::from_secs(60),
            tick: zone_metrics_tx,
            run_immediately: true,
        },
    ];

    // Workers must be listening before the scheduler sends its first ticks.
    tokio::spawn({
        let cfg = cfg.clone();
        let db = db.clone();
        async move {
            while pipeline_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "pipeline");
                let _g = span.enter();
                match jobs::run_pipeline_once(&db, cfg.as_ref(), false).await {
                    Ok(summary) => tracing::info!(status = summary.status, "pipeline done"),
                    Err(e) => tracing::error!(error = %format!("{e:#}"), "pipeline failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while zone_metrics_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "zone_metrics");
                let _g = span.enter();
                if let Err(e) = jobs::run_zone_metrics_once(&db).await {
                    tracing::error!(error = %e, "zone_metrics failed");
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(scheduler_jobs);
    tracing::info!(
        pipeline_interval_secs = cfg.schedule.pipeline_interval_secs,
        run_immediately = cfg.schedule.run_immediately,
        "scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    // Give an in-flight run a moment to finish its current stage, then exit.
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
