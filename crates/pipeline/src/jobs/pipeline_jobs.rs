use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::config::Config;
use common::db::AsyncDb;
use common::types::{format_ts, RunStatus};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::daily_metrics::{self, AggregateStats};
use crate::dim_time::{self, DimTimeStats};
use crate::dim_wallet::{self, DimWalletStats};
use crate::fact_transactions::{self, FactStats};
use crate::quality_checks::{self, CheckScope, QualityGateError, QualityReport};
use crate::staging::{self, StageStats};

use super::maintenance::{self, CheckpointOutcome};
use super::tracker::{StageOutcome, StageTracker};

/// Raw-zone `id` high-water marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HighWater {
    pub raw_transactions: i64,
    pub raw_wallets: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermarks {
    /// Marks recorded by the last successful run.
    pub last: HighWater,
    /// Current maximum raw ids.
    pub current: HighWater,
}

impl Watermarks {
    pub fn has_new_data(&self) -> bool {
        self.current.raw_transactions > self.last.raw_transactions
            || self.current.raw_wallets > self.last.raw_wallets
    }
}

pub fn read_watermarks(conn: &Connection) -> Result<Watermarks> {
    let last = conn
        .query_row(
            "SELECT raw_transactions_high_water, raw_wallets_high_water
             FROM pipeline_runs
             WHERE status = 'success'
             ORDER BY started_at DESC
             LIMIT 1",
            [],
            |r| {
                Ok(HighWater {
                    raw_transactions: r.get(0)?,
                    raw_wallets: r.get(1)?,
                })
            },
        )
        .optional()?
        .unwrap_or_default();
    let current = conn.query_row(
        "SELECT (SELECT COALESCE(MAX(id), 0) FROM raw_transactions),
                (SELECT COALESCE(MAX(id), 0) FROM raw_wallets)",
        [],
        |r| {
            Ok(HighWater {
                raw_transactions: r.get(0)?,
                raw_wallets: r.get(1)?,
            })
        },
    )?;
    Ok(Watermarks { last, current })
}

/// Per-stage counters for one run; stored as `pipeline_runs.stats_json` and logged on completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: &'static str,
    pub forced: bool,
    pub high_water: HighWater,
    pub transactions: Option<StageStats>,
    pub wallets: Option<StageStats>,
    pub dim_time: Option<DimTimeStats>,
    pub dim_wallet: Option<DimWalletStats>,
    pub facts: Option<FactStats>,
    pub aggregates: Option<AggregateStats>,
    pub quality_failures: Vec<String>,
    pub checkpoint: Option<CheckpointOutcome>,
}

/// Run one tracked stage as a single unit of work on the SQLite thread.
async fn tracked<F, R>(db: &AsyncDb, run: &RunContext, stage: &'static str, f: F) -> Result<R>
where
    F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    R: StageOutcome + Send + 'static,
{
    let tracker = StageTracker::start(db, &run.run_id, stage).await?;
    match db.call_named(stage, f).await {
        Ok(out) => {
            tracing::debug!(stage, rows_written = out.rows_written(), "stage done");
            tracker.success(&out).await?;
            Ok(out)
        }
        Err(e) => {
            let e = e.context(stage);
            if let Err(te) = tracker.fail(&e).await {
                tracing::warn!(stage, error = %te, "failed to record stage failure");
            }
            Err(e)
        }
    }
}

fn record_quality(report: &QualityReport, summary: &mut RunSummary, fail_on_failure: bool) -> Result<()> {
    for r in report.failed() {
        metrics::counter!("pipeline_quality_check_failures_total", "check" => r.name).increment(1);
        summary.quality_failures.push(r.name.to_string());
    }
    if fail_on_failure && !report.all_passed() {
        return Err(QualityGateError::from(report).into());
    }
    Ok(())
}

fn record_stage_counters(entity: &'static str, stats: &StageStats) {
    metrics::counter!("pipeline_rows_staged_total", "entity" => entity).increment(stats.staged);
    metrics::counter!("pipeline_rows_rejected_total", "entity" => entity).increment(stats.rejected);
}

async fn run_stages(
    db: &AsyncDb,
    cfg: &Config,
    run: &RunContext,
    marks: Watermarks,
    summary: &mut RunSummary,
    progress: &StageTracker,
) -> Result<()> {
    let since = if run.forced {
        HighWater::default()
    } else {
        marks.last
    };
    let upto = marks.current;
    let started = run.started_at;
    let started_s = format_ts(started);
    let today = started.date_naive();
    // Forced runs re-merge the whole staging zone.
    let staged_since = (!run.forced).then(|| started_s.clone());

    // ── staging ──
    let policy = cfg.policy.clone();
    let tx_stats = tracked(db, run, "stage_transactions", move |conn| {
        staging::stage_transactions(
            conn,
            &policy,
            since.raw_transactions,
            upto.raw_transactions,
            started,
        )
    })
    .await?;
    record_stage_counters("transaction", &tx_stats);
    summary.transactions = Some(tx_stats);

    let policy = cfg.policy.clone();
    let wallet_stats = tracked(db, run, "stage_wallets", move |conn| {
        staging::stage_wallets(conn, &policy, since.raw_wallets, upto.raw_wallets, started)
    })
    .await?;
    record_stage_counters("wallet", &wallet_stats);
    summary.wallets = Some(wallet_stats);
    progress.reached("staging").await?;

    let (run_id, now_s, min_score) = (
        run.run_id.clone(),
        started_s.clone(),
        cfg.policy.min_fact_quality_score,
    );
    let report = tracked(db, run, "quality_checks_staging", move |conn| {
        quality_checks::run_checks(conn, CheckScope::Staging, &run_id, &now_s, min_score)
    })
    .await?;
    record_quality(&report, summary, cfg.quality.fail_on_check_failure)?;

    // ── dimensions and facts ──
    let (start, end) = (cfg.dim_time.start_date, cfg.dim_time.end_date);
    summary.dim_time = Some(
        tracked(db, run, "dim_time", move |conn| {
            dim_time::refresh_dim_time(conn, start, end, today)
        })
        .await?,
    );

    let (since_s, now_s) = (staged_since.clone(), started_s.clone());
    let wallet_dim = tracked(db, run, "dim_wallet", move |conn| {
        dim_wallet::merge_dim_wallet(conn, since_s.as_deref(), &now_s)
    })
    .await?;
    metrics::counter!("pipeline_dim_wallet_versions_total")
        .increment(wallet_dim.inserted + wallet_dim.versioned);
    summary.dim_wallet = Some(wallet_dim);

    let (policy, since_s, loaded_at) = (cfg.policy.clone(), staged_since, started_s.clone());
    summary.facts = Some(
        tracked(db, run, "fact_transactions", move |conn| {
            fact_transactions::merge_fact_transactions(conn, &policy, since_s.as_deref(), &loaded_at)
        })
        .await?,
    );
    progress.reached("analytics").await?;

    let (run_id, now_s) = (run.run_id.clone(), started_s);
    let report = tracked(db, run, "quality_checks_analytics", move |conn| {
        quality_checks::run_checks(conn, CheckScope::Analytics, &run_id, &now_s, min_score)
    })
    .await?;
    record_quality(&report, summary, cfg.quality.fail_on_check_failure)?;

    // ── aggregation ──
    let lookback = cfg.aggregation.lookback_days;
    let aggregates = tracked(db, run, "aggregate_daily", move |conn| {
        daily_metrics::refresh_daily_metrics(conn, lookback, today)
    })
    .await?;
    metrics::counter!("pipeline_daily_metrics_written_total").increment(aggregates.written);
    summary.aggregates = Some(aggregates);

    Ok(())
}

struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    forced: bool,
}

async fn insert_run(
    db: &AsyncDb,
    run: &RunContext,
    status: RunStatus,
    high_water: HighWater,
) -> Result<()> {
    let (run_id, started, forced) = (run.run_id.clone(), format_ts(run.started_at), run.forced);
    let finished = (status != RunStatus::Running).then(|| format_ts(Utc::now()));
    db.call_named("pipeline_runs.insert", move |conn| {
        conn.execute(
            "INSERT INTO pipeline_runs (run_id, started_at, finished_at, status, forced,
                raw_transactions_high_water, raw_wallets_high_water)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                run_id,
                started,
                finished,
                status.as_str(),
                forced,
                high_water.raw_transactions,
                high_water.raw_wallets,
            ],
        )?;
        Ok(())
    })
    .await
}

async fn finish_run(
    db: &AsyncDb,
    run_id: &str,
    status: RunStatus,
    summary: &RunSummary,
    error: Option<String>,
) -> Result<()> {
    let run_id = run_id.to_string();
    let stats_json = serde_json::to_string(summary).context("serializing run summary")?;
    let finished = format_ts(Utc::now());
    db.call_named("pipeline_runs.finish", move |conn| {
        conn.execute(
            "UPDATE pipeline_runs
             SET status = ?2, finished_at = ?3, stats_json = ?4, error = ?5
             WHERE run_id = ?1",
            rusqlite::params![run_id, status.as_str(), finished, stats_json, error],
        )?;
        Ok(())
    })
    .await
}

/// One pipeline run: new-data gate, staging, quality checks, dimensions, facts, aggregates.
///
/// Without `force`, a run with no raw rows past the last successful high-water marks
/// is recorded as `skipped` and touches nothing else. A failed run keeps the previous
/// marks, so the next run re-stages the same keys.
pub async fn run_pipeline_once(db: &AsyncDb, cfg: &Config, force: bool) -> Result<RunSummary> {
    let started_at = Utc::now();
    let run = RunContext {
        run_id: format!("run-{}", started_at.format("%Y%m%dT%H%M%S%.6fZ")),
        started_at,
        forced: force,
    };
    let marks = db
        .call_named("pipeline.read_watermarks", |conn| read_watermarks(conn))
        .await?;

    let mut summary = RunSummary {
        run_id: run.run_id.clone(),
        forced: force,
        high_water: marks.current,
        ..RunSummary::default()
    };

    if !force && !marks.has_new_data() {
        summary.status = RunStatus::Skipped.as_str();
        summary.high_water = marks.last;
        insert_run(db, &run, RunStatus::Skipped, marks.last).await?;
        metrics::counter!("pipeline_runs_total", "status" => "skipped").increment(1);
        tracing::info!(run_id = %run.run_id, "no new raw data since last successful run, skipping");
        return Ok(summary);
    }

    insert_run(db, &run, RunStatus::Running, marks.current).await?;
    let progress = StageTracker::start(db, &run.run_id, "pipeline").await?;
    tracing::info!(
        run_id = %run.run_id,
        forced = force,
        raw_transactions_high_water = marks.current.raw_transactions,
        raw_wallets_high_water = marks.current.raw_wallets,
        "pipeline run started"
    );

    let outcome = run_stages(db, cfg, &run, marks, &mut summary, &progress).await;
    let duration_ms = (Utc::now() - started_at).num_milliseconds() as f64;
    metrics::histogram!("pipeline_run_duration_ms").record(duration_ms);

    match outcome {
        Ok(()) => {
            summary.status = RunStatus::Success.as_str();
            summary.checkpoint = match maintenance::checkpoint_after_run(
                db,
                &cfg.database.path,
                cfg.database.wal_checkpoint_threshold_bytes,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "WAL checkpoint after run failed");
                    None
                }
            };
            finish_run(db, &run.run_id, RunStatus::Success, &summary, None).await?;
            progress.success(&summary).await?;
            metrics::counter!("pipeline_runs_total", "status" => "success").increment(1);
            log_summary(&summary, duration_ms);
            Ok(summary)
        }
        Err(e) => {
            summary.status = RunStatus::Failed.as_str();
            let msg = format!("{e:#}");
            finish_run(db, &run.run_id, RunStatus::Failed, &summary, Some(msg))
                .await
                .context("recording failed pipeline run")?;
            if let Err(te) = progress.fail(&e).await {
                tracing::warn!(error = %te, "failed to record pipeline job failure");
            }
            metrics::counter!("pipeline_runs_total", "status" => "failed").increment(1);
            Err(e)
        }
    }
}

fn log_summary(s: &RunSummary, duration_ms: f64) {
    let tx = s.transactions.unwrap_or_default();
    let w = s.wallets.unwrap_or_default();
    let dw = s.dim_wallet.unwrap_or_default();
    let f = s.facts.unwrap_or_default();
    let a = s.aggregates.unwrap_or_default();
    tracing::info!(
        run_id = %s.run_id,
        duration_ms,
        transactions_staged = tx.staged,
        transactions_rejected = tx.rejected,
        wallets_staged = w.staged,
        wallets_rejected = w.rejected,
        wallet_versions_opened = dw.inserted + dw.versioned,
        facts_merged = f.merged,
        facts_below_threshold = f.below_threshold,
        daily_rows_written = a.written,
        quality_failures = s.quality_failures.len(),
        "pipeline run complete"
    );
}
