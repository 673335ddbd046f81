use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "pipeline_runs_total",
        "Pipeline runs by final status (success, failed, skipped)."
    );
    describe_histogram!(
        "pipeline_run_duration_ms",
        "Wall-clock duration of a non-skipped pipeline run in milliseconds."
    );
    describe_counter!(
        "pipeline_rows_staged_total",
        "Rows written to the staging zone, by entity."
    );
    describe_counter!(
        "pipeline_rows_rejected_total",
        "Raw rows rejected during staging, by entity."
    );
    describe_counter!(
        "pipeline_dim_wallet_versions_total",
        "New dim_wallet versions opened (first sightings and attribute changes)."
    );
    describe_counter!(
        "pipeline_fact_rows_merged_total",
        "Rows inserted or updated in fact_transactions."
    );
    describe_counter!(
        "pipeline_fact_rows_below_threshold_total",
        "Staged transactions held out of the fact table by the quality threshold."
    );
    describe_counter!(
        "pipeline_daily_metrics_written_total",
        "agg_daily_metrics rows written."
    );
    describe_counter!(
        "pipeline_quality_check_failures_total",
        "Failed data quality checks, by check name."
    );
    describe_gauge!("pipeline_zone_rows", "Row count per zone table.");
    describe_gauge!(
        "pipeline_raw_backlog_rows",
        "Raw rows past the last successful run's high-water marks."
    );
    describe_histogram!(
        "pipeline_db_query_latency_ms",
        "SQLite operation latency in milliseconds, by operation."
    );
    describe_counter!(
        "pipeline_db_query_errors_total",
        "Failed SQLite operations, by operation."
    );
    describe_counter!(
        "pipeline_wal_checkpoint_total",
        "Post-run WAL checkpoints by outcome (ok, busy)."
    );
    describe_gauge!(
        "pipeline_wal_checkpoint_pages",
        "Pages checkpointed by the last post-run WAL checkpoint."
    );
}

/// Install the global recorder and serve `/metrics` on `port`. Must run inside a tokio runtime.
pub fn install_prometheus(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}
