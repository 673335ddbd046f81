use anyhow::{Context, Result};
use chrono::Utc;
use common::config::Config;
use common::db::Database;
use common::types::format_ts;
use rusqlite::OptionalExtension;

use crate::daily_metrics;
use crate::dim_time;
use crate::dim_wallet::{self, WalletVersion};
use crate::fact_transactions;
use crate::quality_checks::{self, CheckScope, QualityReport};
use crate::staging;

const DEFAULT_DAILY_LIMIT: u32 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Once { force: bool },
    Stage,
    Analytics,
    Aggregate,
    Check,
    Wallet { address: String },
    Daily { limit: u32 },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "once" => match args.next().as_deref() {
            None => Ok(Command::Once { force: false }),
            Some("--force") => Ok(Command::Once { force: true }),
            Some(other) => Err(format!("unknown flag for once: {other}")),
        },
        "stage" => Ok(Command::Stage),
        "analytics" => Ok(Command::Analytics),
        "aggregate" => Ok(Command::Aggregate),
        "check" => Ok(Command::Check),
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: pipeline wallet <address>".to_string())?;
            Ok(Command::Wallet { address })
        }
        "daily" => {
            let limit = match args.next() {
                Some(n) => n
                    .parse()
                    .map_err(|e| format!("usage: pipeline daily [N]: {e}"))?,
                None => DEFAULT_DAILY_LIMIT,
            };
            Ok(Command::Daily { limit })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

/// Run a one-shot command against the sync database. `Run` and `Once` are handled by the async entry point.
pub fn run_command(db: &mut Database, cfg: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run | Command::Once { .. } => Ok(()),
        Command::Stage => restage_all(db, cfg),
        Command::Analytics => rebuild_analytics(db, cfg),
        Command::Aggregate => reaggregate(db, cfg),
        Command::Check => check(db, cfg),
        Command::Wallet { address } => show_wallet(db, &address),
        Command::Daily { limit } => show_daily(db, limit),
    }
}

/// Re-stage every raw row, ignoring the high-water marks.
fn restage_all(db: &mut Database, cfg: &Config) -> Result<()> {
    let now = Utc::now();
    let (max_tx, max_wallet): (i64, i64) = db.conn.query_row(
        "SELECT (SELECT COALESCE(MAX(id), 0) FROM raw_transactions),
                (SELECT COALESCE(MAX(id), 0) FROM raw_wallets)",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let tx = staging::stage_transactions(&mut db.conn, &cfg.policy, 0, max_tx, now)
        .context("staging transactions")?;
    let w = staging::stage_wallets(&mut db.conn, &cfg.policy, 0, max_wallet, now)
        .context("staging wallets")?;
    println!(
        "transactions: raw={} keys={} staged={} stale={} rejected={}",
        tx.raw_rows, tx.keys, tx.staged, tx.stale, tx.rejected
    );
    println!(
        "wallets:      raw={} keys={} staged={} stale={} rejected={}",
        w.raw_rows, w.keys, w.staged, w.stale, w.rejected
    );
    Ok(())
}

fn rebuild_analytics(db: &mut Database, cfg: &Config) -> Result<()> {
    let now = Utc::now();
    let now_s = format_ts(now);
    let t = dim_time::refresh_dim_time(
        &mut db.conn,
        cfg.dim_time.start_date,
        cfg.dim_time.end_date,
        now.date_naive(),
    )?;
    let w = dim_wallet::merge_dim_wallet(&mut db.conn, None, &now_s)?;
    let f = fact_transactions::merge_fact_transactions(&mut db.conn, &cfg.policy, None, &now_s)?;
    println!("dim_time:          inserted={} refreshed={}", t.inserted, t.refreshed);
    println!(
        "dim_wallet:        wallets={} inserted={} versioned={} unchanged={}",
        w.wallets, w.inserted, w.versioned, w.unchanged
    );
    println!(
        "fact_transactions: candidates={} merged={} stale={} below_threshold={}",
        f.candidates, f.merged, f.stale, f.below_threshold
    );
    Ok(())
}

fn reaggregate(db: &mut Database, cfg: &Config) -> Result<()> {
    let today = Utc::now().date_naive();
    let a = daily_metrics::refresh_daily_metrics(&mut db.conn, cfg.aggregation.lookback_days, today)?;
    println!(
        "agg_daily_metrics: dates={} written={} removed={}",
        a.dates, a.written, a.removed
    );
    Ok(())
}

fn check(db: &mut Database, cfg: &Config) -> Result<()> {
    let now = Utc::now();
    let run_id = format!("cli-{}", now.format("%Y%m%dT%H%M%S%.6fZ"));
    let now_s = format_ts(now);
    let min = cfg.policy.min_fact_quality_score;
    let mut report = QualityReport::default();
    for scope in [CheckScope::Staging, CheckScope::Analytics] {
        let part = quality_checks::run_checks(&mut db.conn, scope, &run_id, &now_s, min)?;
        report.results.extend(part.results);
    }
    println!("Data quality checks ({run_id}):");
    for r in &report.results {
        let mark = if r.passed { "ok  " } else { "FAIL" };
        println!("  {mark}  {:<36} failing_rows={}", r.name, r.failing_rows);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletReport {
    pub versions: Vec<WalletVersion>,
    pub fraud: Option<FraudScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FraudScore {
    pub fraud_score: f64,
    pub is_suspicious: bool,
    pub risk_level: Option<String>,
    pub model_version: Option<String>,
}

pub fn query_wallet(db: &Database, address: &str) -> Result<WalletReport> {
    let address = staging::normalize_address(Some(address)).unwrap_or_default();
    let versions = dim_wallet::wallet_history(&db.conn, &address)?;
    let fraud = db
        .conn
        .query_row(
            "SELECT fraud_score, is_suspicious, risk_level, model_version
             FROM ml_wallet_fraud_scores WHERE wallet_address = ?1",
            [&address],
            |row| {
                Ok(FraudScore {
                    fraud_score: row.get(0)?,
                    is_suspicious: row.get(1)?,
                    risk_level: row.get(2)?,
                    model_version: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(WalletReport { versions, fraud })
}

fn show_wallet(db: &Database, address: &str) -> Result<()> {
    println!("Wallet: {address}");
    let report = query_wallet(db, address)?;
    if report.versions.is_empty() {
        println!("  (not in dim_wallet)");
    }
    for v in &report.versions {
        let a = &v.attributes;
        println!(
            "  v{:<3} {}  balance_eth={:.6}  txs={}  type={}  valid {} .. {}",
            v.version,
            if v.is_current { "current" } else { "expired" },
            a.balance_eth,
            a.total_transactions,
            a.wallet_type.as_str(),
            v.valid_from,
            v.valid_to.as_deref().unwrap_or("-"),
        );
    }
    match report.fraud {
        Some(f) => println!(
            "  fraud_score={:.3}  suspicious={}  risk_level={}  model={}",
            f.fraud_score,
            f.is_suspicious,
            f.risk_level.as_deref().unwrap_or("-"),
            f.model_version.as_deref().unwrap_or("-"),
        ),
        None => println!("  (no fraud score)"),
    }
    Ok(())
}

fn show_daily(db: &Database, limit: u32) -> Result<()> {
    fn pct(v: Option<f64>) -> String {
        v.map_or_else(|| "-".to_string(), |p| format!("{p:+.1}%"))
    }

    println!("Daily metrics (latest {limit}):");
    for r in daily_metrics::latest_daily_metrics(&db.conn, limit)? {
        println!(
            "{}  txs={:>7} ({})  ma7={:>9.1}  success={:>5.1}%  value_eth={:>12.4} ({})  wallets={:>6} ({})",
            r.metric_date,
            r.total_transactions,
            pct(r.tx_count_change_pct),
            r.tx_count_ma_7d,
            r.success_rate * 100.0,
            r.total_value_eth,
            pct(r.value_change_pct),
            r.unique_wallets,
            pct(r.unique_wallets_change_pct),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> std::vec::IntoIter<String> {
        std::iter::once("pipeline")
            .chain(v.iter().copied())
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults_to_run() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
    }

    #[test]
    fn test_parse_once_and_force() {
        assert_eq!(parse_args(args(&["once"])).unwrap(), Command::Once { force: false });
        assert_eq!(
            parse_args(args(&["once", "--force"])).unwrap(),
            Command::Once { force: true }
        );
        assert!(parse_args(args(&["once", "--nope"])).is_err());
    }

    #[test]
    fn test_parse_wallet_and_daily() {
        assert_eq!(
            parse_args(args(&["wallet", "0xabc"])).unwrap(),
            Command::Wallet {
                address: "0xabc".to_string()
            }
        );
        assert!(parse_args(args(&["wallet"])).is_err());
        assert_eq!(
            parse_args(args(&["daily"])).unwrap(),
            Command::Daily {
                limit: DEFAULT_DAILY_LIMIT
            }
        );
        assert_eq!(parse_args(args(&["daily", "3"])).unwrap(), Command::Daily { limit: 3 });
        assert!(parse_args(args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_query_wallet_reads_history_and_fraud_score() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.conn
            .execute_batch(
                "INSERT INTO raw_wallets (wallet_address, balance_wei, total_transactions_in,
                    total_transactions_out, is_contract, ingested_at)
                 VALUES ('0xAB', '5', 1, 0, 0, '2024-01-01 00:00:00');
                 INSERT INTO ml_wallet_fraud_scores (wallet_address, fraud_score, is_suspicious, risk_level)
                 VALUES ('0xab', 0.91, 1, 'high');",
            )
            .unwrap();
        let cfg = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        restage_all(&mut db, &cfg).unwrap();
        dim_wallet::merge_dim_wallet(&mut db.conn, None, "2024-01-02 00:00:00.000000").unwrap();

        let report = query_wallet(&db, "0xAB").unwrap();
        assert_eq!(report.versions.len(), 1);
        assert!(report.versions[0].is_current);
        let fraud = report.fraud.unwrap();
        assert!(fraud.is_suspicious);
        assert_eq!(fraud.risk_level.as_deref(), Some("high"));
    }

    #[test]
    fn test_check_records_both_scopes() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        let cfg = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        check(&mut db, &cfg).unwrap();
        let n: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM data_quality_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 8);
    }
}
