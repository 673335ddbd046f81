//! Staged transactions → `fact_transactions`, merged on `transaction_key`
//! and guarded by `loaded_at`.

use std::str::FromStr;

use anyhow::Result;
use chrono::NaiveDate;
use common::config::{Policy, ValueTierBounds};
use common::types::{time_key, ValueTier};
use rusqlite::Connection;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::staging::wei_to_eth;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FactStats {
    /// Staged rows considered.
    pub candidates: u64,
    /// Rows under the admission threshold.
    pub below_threshold: u64,
    /// Inserted or updated.
    pub merged: u64,
    /// Existing rows with a `loaded_at` at least as new as this run's.
    pub stale: u64,
}

pub fn transaction_key(transaction_id: &str) -> String {
    hex::encode(Sha256::digest(transaction_id.as_bytes()))
}

/// Ordered buckets, first match wins.
pub fn value_tier(value_eth: f64, bounds: &ValueTierBounds) -> ValueTier {
    if value_eth <= 0.0 {
        ValueTier::Zero
    } else if value_eth < bounds.micro_max {
        ValueTier::Micro
    } else if value_eth < bounds.small_max {
        ValueTier::Small
    } else if value_eth < bounds.medium_max {
        ValueTier::Medium
    } else if value_eth < bounds.large_max {
        ValueTier::Large
    } else if value_eth < bounds.very_large_max {
        ValueTier::VeryLarge
    } else {
        ValueTier::Whale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFlags {
    pub is_high_value: bool,
    pub is_micro_transaction: bool,
}

pub fn value_flags(value_eth: f64, policy: &Policy) -> ValueFlags {
    ValueFlags {
        is_high_value: value_eth >= policy.high_value_eth,
        is_micro_transaction: value_eth > 0.0 && value_eth < policy.micro_transaction_eth,
    }
}

struct StagedRow {
    transaction_id: String,
    transaction_hash: String,
    block_number: i64,
    transaction_date: Option<String>,
    transaction_timestamp: Option<String>,
    transaction_hour: Option<i64>,
    from_address: String,
    to_address: Option<String>,
    value_wei: Option<String>,
    gas_limit: Option<i64>,
    gas_used: Option<i64>,
    gas_price_gwei: Option<f64>,
    gas_cost_eth: Option<f64>,
    transaction_type: String,
    is_contract_creation: bool,
    is_contract_interaction: bool,
    is_successful: bool,
    data_quality_score: f64,
    source: Option<String>,
    staged_at: String,
}

fn load_staged(conn: &Connection, staged_since: Option<&str>) -> Result<Vec<StagedRow>> {
    let mut stmt = conn.prepare(
        "SELECT transaction_id, transaction_hash, block_number, transaction_date,
                transaction_timestamp, transaction_hour, from_address, to_address, value_wei,
                gas_limit, gas_used, gas_price_gwei, gas_cost_eth, transaction_type,
                is_contract_creation, is_contract_interaction, is_successful,
                data_quality_score, source, staged_at
         FROM stg_transactions
         WHERE ?1 IS NULL OR staged_at >= ?1
         ORDER BY transaction_id",
    )?;
    let rows = stmt
        .query_map([staged_since], |row| {
            Ok(StagedRow {
                transaction_id: row.get(0)?,
                transaction_hash: row.get(1)?,
                block_number: row.get(2)?,
                transaction_date: row.get(3)?,
                transaction_timestamp: row.get(4)?,
                transaction_hour: row.get(5)?,
                from_address: row.get(6)?,
                to_address: row.get(7)?,
                value_wei: row.get(8)?,
                gas_limit: row.get(9)?,
                gas_used: row.get(10)?,
                gas_price_gwei: row.get(11)?,
                gas_cost_eth: row.get(12)?,
                transaction_type: row.get(13)?,
                is_contract_creation: row.get(14)?,
                is_contract_interaction: row.get(15)?,
                is_successful: row.get(16)?,
                data_quality_score: row.get(17)?,
                source: row.get(18)?,
                staged_at: row.get(19)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Merge staged rows (all, or those staged at/after `staged_since`) into the fact table.
///
/// An existing key is only overwritten when `loaded_at` is strictly newer than the stored one.
pub fn merge_fact_transactions(
    conn: &mut Connection,
    policy: &Policy,
    staged_since: Option<&str>,
    loaded_at: &str,
) -> Result<FactStats> {
    let tx = conn.transaction()?;
    let staged = load_staged(&tx, staged_since)?;
    let mut stats = FactStats {
        candidates: staged.len() as u64,
        ..FactStats::default()
    };

    {
        let mut stmt = tx.prepare(
            "INSERT INTO fact_transactions (
                transaction_key, transaction_id, transaction_hash, block_number, time_key,
                from_wallet_key, to_wallet_key, transaction_date, transaction_timestamp,
                transaction_hour, value_eth, value_wei, gas_limit, gas_used, gas_price_gwei,
                gas_cost_eth, transaction_type, value_tier, is_high_value, is_micro_transaction,
                is_contract_creation, is_contract_interaction, is_successful,
                data_quality_score, source, staged_at, loaded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
             ON CONFLICT(transaction_key) DO UPDATE SET
                transaction_id = excluded.transaction_id,
                transaction_hash = excluded.transaction_hash,
                block_number = excluded.block_number,
                time_key = excluded.time_key,
                from_wallet_key = excluded.from_wallet_key,
                to_wallet_key = excluded.to_wallet_key,
                transaction_date = excluded.transaction_date,
                transaction_timestamp = excluded.transaction_timestamp,
                transaction_hour = excluded.transaction_hour,
                value_eth = excluded.value_eth,
                value_wei = excluded.value_wei,
                gas_limit = excluded.gas_limit,
                gas_used = excluded.gas_used,
                gas_price_gwei = excluded.gas_price_gwei,
                gas_cost_eth = excluded.gas_cost_eth,
                transaction_type = excluded.transaction_type,
                value_tier = excluded.value_tier,
                is_high_value = excluded.is_high_value,
                is_micro_transaction = excluded.is_micro_transaction,
                is_contract_creation = excluded.is_contract_creation,
                is_contract_interaction = excluded.is_contract_interaction,
                is_successful = excluded.is_successful,
                data_quality_score = excluded.data_quality_score,
                source = excluded.source,
                staged_at = excluded.staged_at,
                loaded_at = excluded.loaded_at
             WHERE excluded.loaded_at > fact_transactions.loaded_at",
        )?;

        for s in staged {
            if s.data_quality_score < policy.min_fact_quality_score {
                stats.below_threshold += 1;
                continue;
            }
            let value_wei = s
                .value_wei
                .as_deref()
                .and_then(|v| Decimal::from_str(v).ok())
                .unwrap_or(Decimal::ZERO);
            let value_eth = wei_to_eth(value_wei);
            let tier = value_tier(value_eth, &policy.value_tiers);
            let flags = value_flags(value_eth, policy);
            let time_key = s
                .transaction_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .map(time_key);

            let n = stmt.execute(rusqlite::params![
                transaction_key(&s.transaction_id),
                s.transaction_id,
                s.transaction_hash,
                s.block_number,
                time_key,
                s.from_address,
                s.to_address,
                s.transaction_date,
                s.transaction_timestamp,
                s.transaction_hour,
                value_eth,
                value_wei.to_string(),
                s.gas_limit,
                s.gas_used,
                s.gas_price_gwei,
                s.gas_cost_eth,
                s.transaction_type,
                tier.as_str(),
                flags.is_high_value,
                flags.is_micro_transaction,
                s.is_contract_creation,
                s.is_contract_interaction,
                s.is_successful,
                s.data_quality_score,
                s.source,
                s.staged_at,
                loaded_at,
            ])?;
            if n == 0 {
                stats.stale += 1;
            } else {
                stats.merged += 1;
            }
        }
    }
    tx.commit()?;

    metrics::counter!("pipeline_fact_rows_merged_total").increment(stats.merged);
    metrics::counter!("pipeline_fact_rows_below_threshold_total").increment(stats.below_threshold);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    #[test]
    fn test_micro_value_scenario() {
        let p = Policy::default();
        assert_eq!(value_tier(0.0005, &p.value_tiers), ValueTier::Micro);
        let flags = value_flags(0.0005, &p);
        assert!(flags.is_micro_transaction);
        assert!(!flags.is_high_value);
    }

    #[test]
    fn test_value_tier_boundaries() {
        let b = ValueTierBounds::default();
        assert_eq!(value_tier(0.0, &b), ValueTier::Zero);
        assert_eq!(value_tier(0.01, &b), ValueTier::Small);
        assert_eq!(value_tier(0.5, &b), ValueTier::Medium);
        assert_eq!(value_tier(1.0, &b), ValueTier::Large);
        assert_eq!(value_tier(10.0, &b), ValueTier::VeryLarge);
        assert_eq!(value_tier(100.0, &b), ValueTier::Whale);

        let p = Policy::default();
        assert!(value_flags(10.0, &p).is_high_value);
        assert!(!value_flags(0.001, &p).is_micro_transaction);
        assert!(!value_flags(0.0, &p).is_micro_transaction);
    }

    #[test]
    fn test_transaction_key_is_sha256_hex() {
        let k = transaction_key("0xabc-1");
        assert_eq!(k.len(), 64);
        assert_eq!(k, transaction_key("0xabc-1"));
        assert_ne!(k, transaction_key("0xabc-2"));
        // Known vector: sha256("abc")
        assert_eq!(
            transaction_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn stage(db: &Database, hash: &str, value_wei: &str, score: f64) {
        db.conn
            .execute(
                "INSERT OR REPLACE INTO stg_transactions (
                    transaction_id, transaction_hash, block_number, transaction_timestamp,
                    transaction_date, transaction_hour, from_address, to_address, value_wei,
                    transaction_type, is_contract_creation, is_contract_interaction,
                    is_successful, data_quality_score, quality_issues, raw_id, staged_at
                 ) VALUES (?1 || '-1', ?1, 1, '2024-03-01 10:00:00.000000', '2024-03-01', 10,
                           '0xfrom', '0xto', ?2, 'value_transfer', 0, 0, 1, ?3, '[]', 1,
                           '2024-03-01 12:00:00.000000')",
                rusqlite::params![hash, value_wei, score],
            )
            .unwrap();
    }

    fn fact_value(db: &Database, hash: &str) -> (String, String, String) {
        db.conn
            .query_row(
                "SELECT value_wei, value_tier, loaded_at FROM fact_transactions
                 WHERE transaction_hash = ?1",
                [hash],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
    }

    #[test]
    fn test_merge_admits_by_quality_and_derives_columns() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        stage(&db, "0xaa", "500000000000000", 1.0);
        stage(&db, "0xbb", "1", 0.0);

        let stats = merge_fact_transactions(
            &mut db.conn,
            &Policy::default(),
            None,
            "2024-03-02 00:00:00.000000",
        )
        .unwrap();
        assert_eq!(stats.candidates, 2);
        assert_eq!(stats.below_threshold, 1);
        assert_eq!(stats.merged, 1);

        let (wei, tier, _) = fact_value(&db, "0xaa");
        assert_eq!(wei, "500000000000000");
        assert_eq!(tier, "micro");

        let (key, time_key, micro): (String, i64, bool) = db
            .conn
            .query_row(
                "SELECT transaction_key, time_key, is_micro_transaction FROM fact_transactions",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(key, transaction_key("0xaa-1"));
        assert_eq!(time_key, 20_240_301);
        assert!(micro);
    }

    #[test]
    fn test_older_loaded_at_leaves_row_unchanged() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        let p = Policy::default();

        stage(&db, "0xaa", "5000000000000000000", 1.0);
        merge_fact_transactions(&mut db.conn, &p, None, "2024-03-05 00:00:00.000000").unwrap();
        let before = fact_value(&db, "0xaa");

        // Out-of-order batch carrying different data and an older load time.
        stage(&db, "0xaa", "1", 1.0);
        let stats =
            merge_fact_transactions(&mut db.conn, &p, None, "2024-03-04 00:00:00.000000").unwrap();
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.merged, 0);
        assert_eq!(fact_value(&db, "0xaa"), before);

        // Equal loaded_at is not strictly newer either.
        merge_fact_transactions(&mut db.conn, &p, None, "2024-03-05 00:00:00.000000").unwrap();
        assert_eq!(fact_value(&db, "0xaa"), before);

        // A newer run wins.
        merge_fact_transactions(&mut db.conn, &p, None, "2024-03-06 00:00:00.000000").unwrap();
        let (wei, tier, loaded_at) = fact_value(&db, "0xaa");
        assert_eq!(wei, "1");
        assert_eq!(tier, "micro");
        assert_eq!(loaded_at, "2024-03-06 00:00:00.000000");
    }

    #[test]
    fn test_staged_since_limits_candidates() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        stage(&db, "0xaa", "1", 1.0);
        let stats = merge_fact_transactions(
            &mut db.conn,
            &Policy::default(),
            Some("2024-03-02 00:00:00.000000"),
            "2024-03-02 00:00:00.000000",
        )
        .unwrap();
        assert_eq!(stats.candidates, 0);
    }
}
