use anyhow::{Context, Result};
use common::db::AsyncDb;
use serde::Serialize;
use std::time::Instant;

use crate::daily_metrics::AggregateStats;
use crate::dim_time::DimTimeStats;
use crate::dim_wallet::DimWalletStats;
use crate::fact_transactions::FactStats;
use crate::quality_checks::QualityReport;
use crate::staging::StageStats;

use super::pipeline_jobs::RunSummary;

/// What a finished stage reports back to `job_status`.
pub trait StageOutcome: Serialize {
    /// Rows the stage wrote to its target table(s).
    fn rows_written(&self) -> u64;
}

impl StageOutcome for StageStats {
    fn rows_written(&self) -> u64 {
        self.staged
    }
}

impl StageOutcome for DimTimeStats {
    fn rows_written(&self) -> u64 {
        self.inserted + self.refreshed
    }
}

impl StageOutcome for DimWalletStats {
    fn rows_written(&self) -> u64 {
        self.inserted + 2 * self.versioned
    }
}

impl StageOutcome for FactStats {
    fn rows_written(&self) -> u64 {
        self.merged
    }
}

impl StageOutcome for AggregateStats {
    fn rows_written(&self) -> u64 {
        self.written + self.removed
    }
}

impl StageOutcome for QualityReport {
    // One data_quality_results row per check.
    fn rows_written(&self) -> u64 {
        self.results.len() as u64
    }
}

impl StageOutcome for RunSummary {
    fn rows_written(&self) -> u64 {
        self.transactions.map_or(0, |s| s.rows_written())
            + self.wallets.map_or(0, |s| s.rows_written())
            + self.dim_time.map_or(0, |s| s.rows_written())
            + self.dim_wallet.map_or(0, |s| s.rows_written())
            + self.facts.map_or(0, |s| s.rows_written())
            + self.aggregates.map_or(0, |s| s.rows_written())
    }
}

/// Mirrors one stage of a pipeline run into `job_status`: running → idle | failed.
///
/// The row is keyed by stage name and always reflects the latest run that touched it.
pub struct StageTracker {
    db: AsyncDb,
    run_id: String,
    stage: &'static str,
    start_time: Instant,
}

impl StageTracker {
    pub async fn start(db: &AsyncDb, run_id: &str, stage: &'static str) -> Result<Self> {
        let run = run_id.to_string();
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, run_id, status, last_run_at, updated_at)
                 VALUES (?1, ?2, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    run_id = excluded.run_id,
                    status = 'running',
                    current_stage = NULL,
                    rows_written = NULL,
                    last_run_at = datetime('now'),
                    updated_at = datetime('now'),
                    last_error = NULL,
                    duration_ms = NULL,
                    metadata = NULL",
                rusqlite::params![stage, run],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            run_id: run_id.to_string(),
            stage,
            start_time: Instant::now(),
        })
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    pub async fn success<O: StageOutcome>(self, outcome: &O) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let rows = i64::try_from(outcome.rows_written()).unwrap_or(i64::MAX);
        let outcome_json = serde_json::to_string(outcome)
            .with_context(|| format!("serializing {} outcome for {}", self.stage, self.run_id))?;
        let (stage, run) = (self.stage, self.run_id);

        self.db
            .call_named("job_tracker.success", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'idle',
                        duration_ms = ?3,
                        rows_written = ?4,
                        metadata = ?5,
                        updated_at = datetime('now')
                     WHERE job_name = ?1 AND run_id = ?2",
                    rusqlite::params![stage, run, duration_ms, rows, outcome_json],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let error_msg = format!("{error:#}");
        let (stage, run) = (self.stage, self.run_id);

        self.db
            .call_named("job_tracker.fail", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'failed',
                        duration_ms = ?3,
                        last_error = ?4,
                        updated_at = datetime('now')
                     WHERE job_name = ?1 AND run_id = ?2",
                    rusqlite::params![stage, run, duration_ms, error_msg],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record the last stage a still-running pipeline has completed.
    pub async fn reached(&self, completed: &'static str) -> Result<()> {
        let (stage, run) = (self.stage, self.run_id.clone());

        self.db
            .call_named("job_tracker.reached", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        current_stage = ?3,
                        updated_at = datetime('now')
                     WHERE job_name = ?1 AND run_id = ?2",
                    rusqlite::params![stage, run, completed],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
