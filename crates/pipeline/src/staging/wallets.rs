use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config::Policy;
use common::types::{format_ts, parse_ts, WalletType};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;

use super::{
    cast_f64, cast_flag, cast_i64, dedup_latest, is_not_older, non_blank, normalize_address,
    resolve_amount, wei_to_eth, write_rejections, Cast, RejectReason, Rejection, StageStats,
};

/// One `raw_wallets` snapshot row, numeric columns as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawWallet {
    pub id: i64,
    pub wallet_address: Option<String>,
    pub first_seen_timestamp: Option<String>,
    pub last_seen_timestamp: Option<String>,
    pub balance_wei: Option<String>,
    pub balance_eth: Option<String>,
    pub total_transactions_in: Option<String>,
    pub total_transactions_out: Option<String>,
    pub total_value_in_eth: Option<String>,
    pub total_value_out_eth: Option<String>,
    pub unique_counterparties: Option<String>,
    pub is_contract: Option<String>,
    pub source: Option<String>,
    pub ingested_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedWallet {
    pub wallet_address: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub balance_wei: Decimal,
    pub total_transactions_in: i64,
    pub total_transactions_out: i64,
    pub total_value_in_eth: f64,
    pub total_value_out_eth: f64,
    pub unique_counterparties: i64,
    pub is_contract: bool,
    pub wallet_type: WalletType,
    pub quality_issues: Vec<String>,
    pub source: Option<String>,
    pub raw_id: i64,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl StagedWallet {
    pub fn balance_eth(&self) -> f64 {
        wei_to_eth(self.balance_wei)
    }

    /// Counters are non-negative and their sum fits after [`normalize_wallet`].
    pub fn total_transactions(&self) -> i64 {
        self.total_transactions_in
            .saturating_add(self.total_transactions_out)
    }

    pub fn total_volume_eth(&self) -> f64 {
        self.total_value_in_eth + self.total_value_out_eth
    }

    pub fn net_flow_eth(&self) -> f64 {
        self.total_value_in_eth - self.total_value_out_eth
    }

    /// Whole days between first and last seen; `None` if either is unknown.
    pub fn activity_span_days(&self) -> Option<i64> {
        let (first, last) = (self.first_seen_at?, self.last_seen_at?);
        Some((last - first).num_days().max(0))
    }

    pub fn avg_transactions_per_day(&self) -> Option<f64> {
        let span = self.activity_span_days()?.max(1);
        Some(self.total_transactions() as f64 / span as f64)
    }
}

/// Ordered rule set, first match wins.
pub fn wallet_type(
    is_contract: bool,
    tx_in: i64,
    tx_out: i64,
    balance_eth: f64,
    policy: &Policy,
) -> WalletType {
    if is_contract {
        WalletType::Contract
    } else if tx_in == 0 && tx_out == 0 {
        WalletType::MinimalActivity
    } else if balance_eth >= policy.whale_balance_eth {
        WalletType::Whale
    } else if tx_out == 0 {
        WalletType::ReceiveOnly
    } else if tx_in == 0 {
        WalletType::SendOnly
    } else {
        WalletType::Active
    }
}

pub fn normalize_wallet(
    raw: &RawWallet,
    policy: &Policy,
) -> std::result::Result<StagedWallet, Rejection> {
    let Some(address) = normalize_address(raw.wallet_address.as_deref()) else {
        return Err(Rejection {
            raw_id: raw.id,
            natural_key: None,
            reasons: vec![RejectReason::EmptyWalletAddress],
            quality_issues: vec!["missing_wallet_address".to_string()],
            data_quality_score: None,
        });
    };

    let mut issues = Vec::new();
    let balance_wei = resolve_amount(
        raw.balance_wei.as_deref(),
        raw.balance_eth.as_deref(),
        "balance",
        &mut issues,
    )
    .unwrap_or(Decimal::ZERO);

    // Missing counters mean "none observed"; unparseable ones are flagged.
    let mut count = |s: Option<&str>, name: &str| match cast_i64(s) {
        Cast::Value(v) if v >= 0 => v,
        Cast::Absent => 0,
        _ => {
            issues.push(format!("invalid_{name}"));
            0
        }
    };
    let mut tx_in = count(raw.total_transactions_in.as_deref(), "total_transactions_in");
    let mut tx_out = count(raw.total_transactions_out.as_deref(), "total_transactions_out");
    let counterparties = count(raw.unique_counterparties.as_deref(), "unique_counterparties");
    if tx_in.checked_add(tx_out).is_none() {
        issues.push("invalid_total_transactions".to_string());
        tx_in = 0;
        tx_out = 0;
    }

    let mut amount = |s: Option<&str>, name: &str| match cast_f64(s) {
        Cast::Value(v) if v >= 0.0 => v,
        Cast::Absent => 0.0,
        _ => {
            issues.push(format!("invalid_{name}"));
            0.0
        }
    };
    let value_in = amount(raw.total_value_in_eth.as_deref(), "total_value_in_eth");
    let value_out = amount(raw.total_value_out_eth.as_deref(), "total_value_out_eth");

    let is_contract = cast_flag(raw.is_contract.as_deref()).unwrap_or(false);
    let wallet_type = wallet_type(is_contract, tx_in, tx_out, wei_to_eth(balance_wei), policy);

    Ok(StagedWallet {
        wallet_address: address,
        first_seen_at: raw.first_seen_timestamp.as_deref().and_then(parse_ts),
        last_seen_at: raw.last_seen_timestamp.as_deref().and_then(parse_ts),
        balance_wei,
        total_transactions_in: tx_in,
        total_transactions_out: tx_out,
        total_value_in_eth: value_in,
        total_value_out_eth: value_out,
        unique_counterparties: counterparties,
        is_contract,
        wallet_type,
        quality_issues: issues,
        source: non_blank(raw.source.as_deref()),
        raw_id: raw.id,
        ingested_at: raw.ingested_at.as_deref().and_then(parse_ts),
    })
}

fn load_raw_wallets(conn: &Connection, since_id: i64, up_to_id: i64) -> Result<Vec<RawWallet>> {
    let mut stmt = conn.prepare(
        "
        SELECT id, wallet_address, CAST(first_seen_timestamp AS TEXT),
               CAST(last_seen_timestamp AS TEXT), CAST(balance_wei AS TEXT),
               CAST(balance_eth AS TEXT), CAST(total_transactions_in AS TEXT),
               CAST(total_transactions_out AS TEXT), CAST(total_value_in_eth AS TEXT),
               CAST(total_value_out_eth AS TEXT), CAST(unique_counterparties AS TEXT),
               CAST(is_contract AS TEXT), source, CAST(ingested_at AS TEXT)
        FROM raw_wallets
        WHERE id <= ?2
          AND (
            id > ?1
            OR LOWER(TRIM(wallet_address)) IN (
                SELECT LOWER(TRIM(wallet_address))
                FROM raw_wallets
                WHERE id > ?1 AND id <= ?2 AND wallet_address IS NOT NULL
            )
          )
        ORDER BY id ASC
        ",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![since_id, up_to_id], |row| {
            Ok(RawWallet {
                id: row.get(0)?,
                wallet_address: row.get(1)?,
                first_seen_timestamp: row.get(2)?,
                last_seen_timestamp: row.get(3)?,
                balance_wei: row.get(4)?,
                balance_eth: row.get(5)?,
                total_transactions_in: row.get(6)?,
                total_transactions_out: row.get(7)?,
                total_value_in_eth: row.get(8)?,
                total_value_out_eth: row.get(9)?,
                unique_counterparties: row.get(10)?,
                is_contract: row.get(11)?,
                source: row.get(12)?,
                ingested_at: row.get(13)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_staged(tx: &rusqlite::Transaction<'_>, w: &StagedWallet, staged_at: &str) -> Result<bool> {
    let incoming = w.ingested_at.map(format_ts);
    let stored: Option<Option<String>> = tx
        .query_row(
            "SELECT ingested_at FROM stg_wallets WHERE wallet_address = ?1",
            [&w.wallet_address],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stored) = stored {
        if !is_not_older(incoming.as_deref(), stored.as_deref()) {
            return Ok(false);
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO stg_wallets (
            wallet_address, first_seen_at, last_seen_at, balance_wei, balance_eth,
            total_transactions, total_transactions_in, total_transactions_out,
            total_value_in_eth, total_value_out_eth, total_volume_eth, net_flow_eth,
            unique_counterparties, activity_span_days, avg_transactions_per_day,
            is_contract, wallet_type, quality_issues, source, raw_id, ingested_at, staged_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
        rusqlite::params![
            w.wallet_address,
            w.first_seen_at.map(format_ts),
            w.last_seen_at.map(format_ts),
            w.balance_wei.to_string(),
            w.balance_eth(),
            w.total_transactions(),
            w.total_transactions_in,
            w.total_transactions_out,
            w.total_value_in_eth,
            w.total_value_out_eth,
            w.total_volume_eth(),
            w.net_flow_eth(),
            w.unique_counterparties,
            w.activity_span_days(),
            w.avg_transactions_per_day(),
            w.is_contract,
            w.wallet_type.as_str(),
            serde_json::to_string(&w.quality_issues)?,
            w.source,
            w.raw_id,
            incoming,
            staged_at,
        ],
    )?;
    Ok(true)
}

/// Stage every wallet address touched by raw rows in `(since_id, up_to_id]`.
pub fn stage_wallets(
    conn: &mut Connection,
    policy: &Policy,
    since_id: i64,
    up_to_id: i64,
    now: DateTime<Utc>,
) -> Result<StageStats> {
    let raw = load_raw_wallets(conn, since_id, up_to_id)?;
    let mut stats = StageStats {
        raw_rows: raw.len() as u64,
        ..StageStats::default()
    };

    let (keyed, unkeyed): (Vec<_>, Vec<_>) = raw
        .into_iter()
        .partition(|r| normalize_address(r.wallet_address.as_deref()).is_some());
    let latest = dedup_latest(
        keyed,
        |r| normalize_address(r.wallet_address.as_deref()),
        |r| r.ingested_at.as_deref().and_then(parse_ts),
    );
    stats.keys = latest.len() as u64;

    let mut staged = Vec::with_capacity(latest.len());
    let mut rejections = Vec::new();
    for r in unkeyed.iter().chain(latest.iter()) {
        match normalize_wallet(r, policy) {
            Ok(w) => staged.push(w),
            Err(rej) => rejections.push(rej),
        }
    }

    let now_s = format_ts(now);
    let tx = conn.transaction()?;
    for w in &staged {
        if upsert_staged(&tx, w, &now_s)? {
            stats.staged += 1;
        } else {
            stats.stale += 1;
        }
    }
    write_rejections(&tx, "wallet", &rejections, &now_s)?;
    tx.commit()?;

    stats.rejected = rejections.len() as u64;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    fn raw(id: i64) -> RawWallet {
        RawWallet {
            id,
            wallet_address: Some(" 0xWALLET".to_string()),
            first_seen_timestamp: Some("2024-01-01 00:00:00".to_string()),
            last_seen_timestamp: Some("2024-01-11 00:00:00".to_string()),
            balance_wei: Some("2000000000000000000".to_string()),
            total_transactions_in: Some("6".to_string()),
            total_transactions_out: Some("4".to_string()),
            total_value_in_eth: Some("3.5".to_string()),
            total_value_out_eth: Some("1.5".to_string()),
            unique_counterparties: Some("5".to_string()),
            is_contract: Some("0".to_string()),
            ingested_at: Some("2024-01-12 00:00:00".to_string()),
            ..RawWallet::default()
        }
    }

    #[test]
    fn test_minimal_activity_scenario() {
        let r = RawWallet {
            total_transactions_in: Some("0".to_string()),
            total_transactions_out: Some("0".to_string()),
            is_contract: Some("false".to_string()),
            ..raw(1)
        };
        let w = normalize_wallet(&r, &Policy::default()).unwrap();
        assert_eq!(w.wallet_type, WalletType::MinimalActivity);
    }

    #[test]
    fn test_wallet_type_rule_order() {
        let p = Policy::default();
        assert_eq!(wallet_type(true, 0, 0, 5000.0, &p), WalletType::Contract);
        assert_eq!(wallet_type(false, 0, 0, 5000.0, &p), WalletType::MinimalActivity);
        assert_eq!(wallet_type(false, 1, 0, 1000.0, &p), WalletType::Whale);
        assert_eq!(wallet_type(false, 3, 0, 1.0, &p), WalletType::ReceiveOnly);
        assert_eq!(wallet_type(false, 0, 3, 1.0, &p), WalletType::SendOnly);
        assert_eq!(wallet_type(false, 3, 3, 1.0, &p), WalletType::Active);
    }

    #[test]
    fn test_derived_metrics() {
        let w = normalize_wallet(&raw(1), &Policy::default()).unwrap();
        assert_eq!(w.wallet_address, "0xwallet");
        assert_eq!(w.total_transactions(), 10);
        assert!((w.balance_eth() - 2.0).abs() < f64::EPSILON);
        assert!((w.total_volume_eth() - 5.0).abs() < f64::EPSILON);
        assert!((w.net_flow_eth() - 2.0).abs() < f64::EPSILON);
        assert_eq!(w.activity_span_days(), Some(10));
        assert!((w.avg_transactions_per_day().unwrap() - 1.0).abs() < f64::EPSILON);
        assert_eq!(w.wallet_type, WalletType::Active);
    }

    #[test]
    fn test_same_day_span_divides_by_one() {
        let r = RawWallet {
            last_seen_timestamp: Some("2024-01-01 06:00:00".to_string()),
            ..raw(1)
        };
        let w = normalize_wallet(&r, &Policy::default()).unwrap();
        assert_eq!(w.activity_span_days(), Some(0));
        assert!((w.avg_transactions_per_day().unwrap() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_counts_default_and_invalid_are_flagged() {
        let r = RawWallet {
            total_transactions_in: None,
            total_transactions_out: Some("many".to_string()),
            ..raw(1)
        };
        let w = normalize_wallet(&r, &Policy::default()).unwrap();
        assert_eq!(w.total_transactions(), 0);
        assert_eq!(w.quality_issues, vec!["invalid_total_transactions_out".to_string()]);
    }

    #[test]
    fn test_negative_counter_is_flagged() {
        let r = RawWallet {
            total_transactions_in: Some("-3".to_string()),
            ..raw(1)
        };
        let w = normalize_wallet(&r, &Policy::default()).unwrap();
        assert_eq!(w.total_transactions_in, 0);
        assert_eq!(w.total_transactions(), 4);
        assert_eq!(w.quality_issues, vec!["invalid_total_transactions_in".to_string()]);
    }

    #[test]
    fn test_overflowing_counters_are_flagged_not_summed() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.conn
            .execute(
                "INSERT INTO raw_wallets (wallet_address, balance_wei, total_transactions_in,
                    total_transactions_out, is_contract, ingested_at)
                 VALUES ('0xab', '1', '9223372036854775807', '1', 0, '2024-01-01 00:00:00')",
                [],
            )
            .unwrap();

        let stats = stage_wallets(&mut db.conn, &Policy::default(), 0, 1, Utc::now()).unwrap();
        assert_eq!(stats.staged, 1);
        assert_eq!(stats.rejected, 0);

        let (total, kind, issues): (i64, String, String) = db
            .conn
            .query_row(
                "SELECT total_transactions, wallet_type, quality_issues FROM stg_wallets",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(total, 0);
        assert_eq!(kind, "minimal_activity");
        assert_eq!(issues, r#"["invalid_total_transactions"]"#);
    }

    #[test]
    fn test_blank_address_is_rejected() {
        let r = RawWallet {
            wallet_address: Some("   ".to_string()),
            ..raw(9)
        };
        let rej = normalize_wallet(&r, &Policy::default()).unwrap_err();
        assert_eq!(rej.raw_id, 9);
        assert_eq!(rej.reasons, vec![RejectReason::EmptyWalletAddress]);
    }

    fn insert_raw(db: &Database, address: &str, balance_wei: &str, ingested_at: &str) {
        db.conn
            .execute(
                "INSERT INTO raw_wallets (wallet_address, balance_wei, total_transactions_in,
                    total_transactions_out, is_contract, ingested_at)
                 VALUES (?1, ?2, 1, 1, 0, ?3)",
                rusqlite::params![address, balance_wei, ingested_at],
            )
            .unwrap();
    }

    #[test]
    fn test_stage_wallets_one_row_per_address() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        insert_raw(&db, "0xAB", "1", "2024-01-01 00:00:00");
        insert_raw(&db, "0xab", "2", "2024-01-02 00:00:00");
        insert_raw(&db, "0xcd", "3", "2024-01-01 00:00:00");
        insert_raw(&db, "", "3", "2024-01-01 00:00:00");

        let stats = stage_wallets(&mut db.conn, &Policy::default(), 0, 4, Utc::now()).unwrap();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.staged, 2);
        assert_eq!(stats.rejected, 1);

        let (rows, balance): (i64, String) = db
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM stg_wallets),
                        (SELECT balance_wei FROM stg_wallets WHERE wallet_address = '0xab')",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(balance, "2");
    }
}
