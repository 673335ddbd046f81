//! Post-stage data quality checks. Each check counts offending rows; results are
//! stored per run in `data_quality_results`.

use anyhow::Result;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScope {
    /// Run right after staging, before anything reaches the analytics zone.
    Staging,
    /// Run after the dimension/fact merge.
    Analytics,
}

struct Check {
    name: &'static str,
    scope: CheckScope,
    /// `?1` is bound to the run timestamp where a check needs it.
    sql: &'static str,
}

const CHECKS: &[Check] = &[
    Check {
        name: "stg_null_transaction_hash",
        scope: CheckScope::Staging,
        sql: "SELECT COUNT(*) FROM stg_transactions
              WHERE transaction_hash IS NULL OR TRIM(transaction_hash) = ''",
    },
    Check {
        name: "stg_future_timestamps",
        scope: CheckScope::Staging,
        sql: "SELECT COUNT(*) FROM stg_transactions WHERE transaction_timestamp > ?1",
    },
    Check {
        name: "stg_duplicate_transaction_ids",
        scope: CheckScope::Staging,
        sql: "SELECT COUNT(*) FROM (
                SELECT transaction_id FROM stg_transactions
                GROUP BY transaction_id HAVING COUNT(*) > 1
              )",
    },
    Check {
        name: "stg_duplicate_transaction_hashes",
        scope: CheckScope::Staging,
        sql: "SELECT COUNT(*) FROM (
                SELECT transaction_hash FROM stg_transactions
                GROUP BY transaction_hash HAVING COUNT(*) > 1
              )",
    },
    Check {
        name: "stg_duplicate_wallets",
        scope: CheckScope::Staging,
        sql: "SELECT COUNT(*) FROM (
                SELECT wallet_address FROM stg_wallets
                GROUP BY wallet_address HAVING COUNT(*) > 1
              )",
    },
    Check {
        name: "dim_wallet_multiple_current",
        scope: CheckScope::Analytics,
        sql: "SELECT COUNT(*) FROM (
                SELECT wallet_address FROM dim_wallet WHERE is_current = 1
                GROUP BY wallet_address HAVING COUNT(*) > 1
              )",
    },
    Check {
        name: "fact_unknown_time_key",
        scope: CheckScope::Analytics,
        sql: "SELECT COUNT(*) FROM fact_transactions f
              WHERE f.time_key IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM dim_time t WHERE t.time_key = f.time_key)",
    },
    Check {
        name: "fact_below_quality_threshold",
        scope: CheckScope::Analytics,
        sql: "SELECT COUNT(*) FROM fact_transactions WHERE data_quality_score < ?2",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub failing_rows: i64,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QualityReport {
    pub results: Vec<CheckResult>,
}

impl QualityReport {
    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.failed().next().is_none()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("data quality checks failed: {}", .failed.join(", "))]
pub struct QualityGateError {
    pub failed: Vec<String>,
}

impl From<&QualityReport> for QualityGateError {
    fn from(report: &QualityReport) -> Self {
        Self {
            failed: report.failed().map(|r| r.name.to_string()).collect(),
        }
    }
}

/// Run every check in `scope` and record the results under `run_id`.
pub fn run_checks(
    conn: &mut Connection,
    scope: CheckScope,
    run_id: &str,
    now: &str,
    min_fact_quality_score: f64,
) -> Result<QualityReport> {
    let tx = conn.transaction()?;
    let mut report = QualityReport::default();
    for check in CHECKS.iter().filter(|c| c.scope == scope) {
        let mut stmt = tx.prepare(check.sql)?;
        // Bind only what the statement declares.
        let failing_rows: i64 = match stmt.parameter_count() {
            0 => stmt.query_row([], |r| r.get(0))?,
            1 => stmt.query_row([now], |r| r.get(0))?,
            _ => stmt.query_row(rusqlite::params![now, min_fact_quality_score], |r| r.get(0))?,
        };
        drop(stmt);

        let passed = failing_rows == 0;
        if !passed {
            tracing::warn!(check = check.name, failing_rows, "data quality check failed");
        }
        tx.execute(
            "INSERT OR REPLACE INTO data_quality_results
                (run_id, check_name, failing_rows, passed, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![run_id, check.name, failing_rows, passed, now],
        )?;
        report.results.push(CheckResult {
            name: check.name,
            failing_rows,
            passed,
        });
    }
    tx.commit()?;
    Ok(report)
}
