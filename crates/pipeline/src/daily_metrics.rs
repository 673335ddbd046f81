//! Daily rollups of `fact_transactions` with trailing moving averages and
//! day-over-day changes. Output is a keyed overwrite of `agg_daily_metrics`.

use anyhow::Result;
use chrono::NaiveDate;
use common::types::{format_date, time_key};
use rusqlite::Connection;

/// One output row. Field order matches the table.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyMetrics {
    pub metric_date: String,
    pub total_transactions: i64,
    pub successful_transactions: i64,
    pub failed_transactions: i64,
    pub success_rate: f64,
    pub total_value_eth: f64,
    pub avg_value_eth: f64,
    pub min_value_eth: f64,
    pub max_value_eth: f64,
    pub zero_value_transactions: i64,
    pub micro_transactions: i64,
    pub small_transactions: i64,
    pub medium_transactions: i64,
    pub large_transactions: i64,
    pub very_large_transactions: i64,
    pub whale_transactions: i64,
    pub high_value_transactions: i64,
    pub contract_creations: i64,
    pub contract_calls: i64,
    pub value_transfers: i64,
    pub total_gas_used: i64,
    pub avg_gas_used: Option<f64>,
    pub avg_gas_price_gwei: Option<f64>,
    pub total_gas_cost_eth: f64,
    pub unique_senders: i64,
    pub unique_receivers: i64,
    pub unique_wallets: i64,
    pub windows: WindowColumns,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowColumns {
    pub tx_count_ma_7d: f64,
    pub tx_count_ma_30d: f64,
    pub value_ma_7d: f64,
    pub value_ma_30d: f64,
    pub tx_count_change_pct: Option<f64>,
    pub value_change_pct: Option<f64>,
    pub unique_wallets_change_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregateStats {
    /// Dates in the fact table.
    pub dates: u64,
    /// Rows written this run.
    pub written: u64,
    /// Rows removed because their date left the fact table (full refresh only).
    pub removed: u64,
}

/// Mean of the `window` rows ending at `i` (inclusive); shorter at the start of the series.
fn trailing_mean(values: &[f64], i: usize, window: usize) -> f64 {
    let start = (i + 1).saturating_sub(window);
    let slice = &values[start..=i];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Percentage change against the previous row; `None` without a usable denominator.
fn pct_change(prev: Option<f64>, cur: f64) -> Option<f64> {
    match prev {
        Some(p) if p != 0.0 => Some((cur - p) / p * 100.0),
        _ => None,
    }
}

/// Fill the window columns over a date-ascending series.
pub fn compute_windows(rows: &mut [DailyMetrics]) {
    let counts: Vec<f64> = rows.iter().map(|r| r.total_transactions as f64).collect();
    let values: Vec<f64> = rows.iter().map(|r| r.total_value_eth).collect();
    let wallets: Vec<f64> = rows.iter().map(|r| r.unique_wallets as f64).collect();

    for (i, row) in rows.iter_mut().enumerate() {
        let prev = i.checked_sub(1);
        row.windows = WindowColumns {
            tx_count_ma_7d: trailing_mean(&counts, i, 7),
            tx_count_ma_30d: trailing_mean(&counts, i, 30),
            value_ma_7d: trailing_mean(&values, i, 7),
            value_ma_30d: trailing_mean(&values, i, 30),
            tx_count_change_pct: pct_change(prev.map(|p| counts[p]), counts[i]),
            value_change_pct: pct_change(prev.map(|p| values[p]), values[i]),
            unique_wallets_change_pct: pct_change(prev.map(|p| wallets[p]), wallets[i]),
        };
    }
}

fn base_aggregates(conn: &Connection) -> Result<Vec<DailyMetrics>> {
    let mut stmt = conn.prepare(
        "
        SELECT
            f.transaction_date,
            COUNT(*),
            SUM(f.is_successful),
            SUM(1 - f.is_successful),
            SUM(f.value_eth),
            AVG(f.value_eth),
            MIN(f.value_eth),
            MAX(f.value_eth),
            SUM(f.value_tier = 'zero'),
            SUM(f.value_tier = 'micro'),
            SUM(f.value_tier = 'small'),
            SUM(f.value_tier = 'medium'),
            SUM(f.value_tier = 'large'),
            SUM(f.value_tier = 'very_large'),
            SUM(f.value_tier = 'whale'),
            SUM(f.is_high_value),
            SUM(f.transaction_type = 'contract_creation'),
            SUM(f.transaction_type = 'contract_call'),
            SUM(f.transaction_type = 'value_transfer'),
            COALESCE(SUM(f.gas_used), 0),
            AVG(f.gas_used),
            AVG(f.gas_price_gwei),
            COALESCE(SUM(f.gas_cost_eth), 0.0),
            COUNT(DISTINCT f.from_wallet_key),
            COUNT(DISTINCT f.to_wallet_key),
            (
                SELECT COUNT(*) FROM (
                    SELECT from_wallet_key AS w FROM fact_transactions
                    WHERE transaction_date = f.transaction_date
                    UNION
                    SELECT to_wallet_key FROM fact_transactions
                    WHERE transaction_date = f.transaction_date AND to_wallet_key IS NOT NULL
                )
            )
        FROM fact_transactions f
        WHERE f.transaction_date IS NOT NULL
        GROUP BY f.transaction_date
        ORDER BY f.transaction_date ASC
        ",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let total: i64 = row.get(1)?;
            let successful: i64 = row.get(2)?;
            Ok(DailyMetrics {
                metric_date: row.get(0)?,
                total_transactions: total,
                successful_transactions: successful,
                failed_transactions: row.get(3)?,
                success_rate: if total > 0 {
                    successful as f64 / total as f64
                } else {
                    0.0
                },
                total_value_eth: row.get(4)?,
                avg_value_eth: row.get(5)?,
                min_value_eth: row.get(6)?,
                max_value_eth: row.get(7)?,
                zero_value_transactions: row.get(8)?,
                micro_transactions: row.get(9)?,
                small_transactions: row.get(10)?,
                medium_transactions: row.get(11)?,
                large_transactions: row.get(12)?,
                very_large_transactions: row.get(13)?,
                whale_transactions: row.get(14)?,
                high_value_transactions: row.get(15)?,
                contract_creations: row.get(16)?,
                contract_calls: row.get(17)?,
                value_transfers: row.get(18)?,
                total_gas_used: row.get(19)?,
                avg_gas_used: row.get(20)?,
                avg_gas_price_gwei: row.get(21)?,
                total_gas_cost_eth: row.get(22)?,
                unique_senders: row.get(23)?,
                unique_receivers: row.get(24)?,
                unique_wallets: row.get(25)?,
                windows: WindowColumns::default(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_row(tx: &rusqlite::Transaction<'_>, r: &DailyMetrics) -> Result<()> {
    let time_key = NaiveDate::parse_from_str(&r.metric_date, "%Y-%m-%d")
        .map(time_key)
        .unwrap_or_default();
    let w = &r.windows;
    tx.execute(
        "INSERT OR REPLACE INTO agg_daily_metrics (
            metric_date, time_key, total_transactions, successful_transactions,
            failed_transactions, success_rate, total_value_eth, avg_value_eth, min_value_eth,
            max_value_eth, zero_value_transactions, micro_transactions, small_transactions,
            medium_transactions, large_transactions, very_large_transactions, whale_transactions,
            high_value_transactions, contract_creations, contract_calls, value_transfers,
            total_gas_used, avg_gas_used, avg_gas_price_gwei, total_gas_cost_eth,
            unique_senders, unique_receivers, unique_wallets,
            tx_count_ma_7d, tx_count_ma_30d, value_ma_7d, value_ma_30d,
            tx_count_change_pct, value_change_pct, unique_wallets_change_pct
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                   ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32,
                   ?33, ?34, ?35)",
        rusqlite::params![
            r.metric_date,
            time_key,
            r.total_transactions,
            r.successful_transactions,
            r.failed_transactions,
            r.success_rate,
            r.total_value_eth,
            r.avg_value_eth,
            r.min_value_eth,
            r.max_value_eth,
            r.zero_value_transactions,
            r.micro_transactions,
            r.small_transactions,
            r.medium_transactions,
            r.large_transactions,
            r.very_large_transactions,
            r.whale_transactions,
            r.high_value_transactions,
            r.contract_creations,
            r.contract_calls,
            r.value_transfers,
            r.total_gas_used,
            r.avg_gas_used,
            r.avg_gas_price_gwei,
            r.total_gas_cost_eth,
            r.unique_senders,
            r.unique_receivers,
            r.unique_wallets,
            w.tx_count_ma_7d,
            w.tx_count_ma_30d,
            w.value_ma_7d,
            w.value_ma_30d,
            w.tx_count_change_pct,
            w.value_change_pct,
            w.unique_wallets_change_pct,
        ],
    )?;
    Ok(())
}

/// Recompute daily metrics.
///
/// `lookback_days == 0` rewrites every date and drops dates no longer present in the
/// fact table; otherwise only dates on or after `today - lookback_days` are rewritten.
/// Window columns always see the full series.
pub fn refresh_daily_metrics(
    conn: &mut Connection,
    lookback_days: u32,
    today: NaiveDate,
) -> Result<AggregateStats> {
    let tx = conn.transaction()?;
    let mut rows = base_aggregates(&tx)?;
    compute_windows(&mut rows);

    let cutoff = (lookback_days > 0)
        .then(|| format_date(today - chrono::Duration::days(i64::from(lookback_days))));
    let mut stats = AggregateStats {
        dates: rows.len() as u64,
        ..AggregateStats::default()
    };

    if cutoff.is_none() {
        let removed = tx.execute(
            "DELETE FROM agg_daily_metrics
             WHERE metric_date NOT IN (
                SELECT DISTINCT transaction_date FROM fact_transactions
                WHERE transaction_date IS NOT NULL
             )",
            [],
        )?;
        stats.removed = removed as u64;
    }
    for r in rows
        .iter()
        .filter(|r| cutoff.as_ref().is_none_or(|c| r.metric_date >= *c))
    {
        write_row(&tx, r)?;
        stats.written += 1;
    }
    tx.commit()?;
    Ok(stats)
}

/// Latest `limit` rows, newest first.
pub fn latest_daily_metrics(conn: &Connection, limit: u32) -> Result<Vec<DailyMetricsSummary>> {
    let mut stmt = conn.prepare(
        "SELECT metric_date, total_transactions, success_rate, total_value_eth,
                tx_count_ma_7d, value_ma_7d, tx_count_change_pct, value_change_pct,
                unique_wallets, unique_wallets_change_pct
         FROM agg_daily_metrics
         ORDER BY metric_date DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(DailyMetricsSummary {
                metric_date: row.get(0)?,
                total_transactions: row.get(1)?,
                success_rate: row.get(2)?,
                total_value_eth: row.get(3)?,
                tx_count_ma_7d: row.get(4)?,
                value_ma_7d: row.get(5)?,
                tx_count_change_pct: row.get(6)?,
                value_change_pct: row.get(7)?,
                unique_wallets: row.get(8)?,
                unique_wallets_change_pct: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyMetricsSummary {
    pub metric_date: String,
    pub total_transactions: i64,
    pub success_rate: f64,
    pub total_value_eth: f64,
    pub tx_count_ma_7d: f64,
    pub value_ma_7d: f64,
    pub tx_count_change_pct: Option<f64>,
    pub value_change_pct: Option<f64>,
    pub unique_wallets: i64,
    pub unique_wallets_change_pct: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    fn fact(db: &Database, key: &str, date: &str, from: &str, to: Option<&str>, value: f64, ok: bool) {
        db.conn
            .execute(
                "INSERT INTO fact_transactions (
                    transaction_key, transaction_id, transaction_hash, block_number,
                    from_wallet_key, to_wallet_key, transaction_date, value_eth, value_wei,
                    gas_used, gas_price_gwei, gas_cost_eth, transaction_type, value_tier,
                    is_high_value, is_micro_transaction, is_contract_creation,
                    is_contract_interaction, is_successful, data_quality_score, staged_at, loaded_at
                 ) VALUES (?1, ?1, ?1, 1, ?2, ?3, ?4, ?5, '0', 21000, 20.0, 0.00042,
                           'value_transfer', 'medium', 0, 0, 0, 0, ?6, 1.0, 't', 't')",
                rusqlite::params![key, from, to, date, value, ok],
            )
            .unwrap();
    }

    fn dump(db: &Database) -> Vec<(String, i64, f64, Option<f64>, Option<f64>)> {
        db.conn
            .prepare(
                "SELECT metric_date, total_transactions, tx_count_ma_7d, tx_count_change_pct,
                        unique_wallets_change_pct
                 FROM agg_daily_metrics ORDER BY metric_date",
            )
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    fn seeded() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        fact(&db, "a", "2024-03-01", "0x1", Some("0x2"), 1.0, true);
        fact(&db, "b", "2024-03-02", "0x1", Some("0x3"), 2.0, true);
        fact(&db, "c", "2024-03-02", "0x2", None, 0.5, false);
        fact(&db, "d", "2024-03-03", "0x4", Some("0x4"), 4.0, true);
        db
    }

    #[test]
    fn test_trailing_mean_and_pct_change() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((trailing_mean(&v, 0, 7) - 1.0).abs() < f64::EPSILON);
        assert!((trailing_mean(&v, 3, 2) - 3.5).abs() < f64::EPSILON);
        assert!((trailing_mean(&v, 3, 30) - 2.5).abs() < f64::EPSILON);

        assert_eq!(pct_change(None, 5.0), None);
        assert_eq!(pct_change(Some(0.0), 5.0), None);
        assert!((pct_change(Some(2.0), 3.0).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_day_has_null_change_pct() {
        let mut db = seeded();
        refresh_daily_metrics(&mut db.conn, 0, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap())
            .unwrap();
        let rows = dump(&db);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].3, None);
        assert_eq!(rows[0].4, None);
        // 1 → 2 transactions
        assert!((rows[1].3.unwrap() - 100.0).abs() < 1e-9);
        // trailing mean of [1, 2, 1]
        assert!((rows[2].2 - 4.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_base_aggregates() {
        let mut db = seeded();
        refresh_daily_metrics(&mut db.conn, 0, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap())
            .unwrap();
        let (failed, rate, senders, receivers, wallets, value): (i64, f64, i64, i64, i64, f64) = db
            .conn
            .query_row(
                "SELECT failed_transactions, success_rate, unique_senders, unique_receivers,
                        unique_wallets, total_value_eth
                 FROM agg_daily_metrics WHERE metric_date = '2024-03-02'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .unwrap();
        assert_eq!(failed, 1);
        assert!((rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(senders, 2);
        assert_eq!(receivers, 1);
        // 0x1, 0x2, 0x3
        assert_eq!(wallets, 3);
        assert!((value - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut db = seeded();
        let today = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        refresh_daily_metrics(&mut db.conn, 0, today).unwrap();
        let once = dump(&db);
        refresh_daily_metrics(&mut db.conn, 0, today).unwrap();
        assert_eq!(dump(&db), once);
        refresh_daily_metrics(&mut db.conn, 7, today).unwrap();
        assert_eq!(dump(&db), once);
    }

    #[test]
    fn test_lookback_window_only_rewrites_recent_dates() {
        let mut db = seeded();
        let today = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let stats = refresh_daily_metrics(&mut db.conn, 1, today).unwrap();
        assert_eq!(stats.dates, 3);
        assert_eq!(stats.written, 2);
        // Window columns still see the 2024-03-01 row.
        let rows = dump(&db);
        assert_eq!(rows[0].0, "2024-03-02");
        assert!((rows[0].3.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_refresh_removes_vanished_dates() {
        let mut db = seeded();
        let today = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        refresh_daily_metrics(&mut db.conn, 0, today).unwrap();
        db.conn
            .execute("DELETE FROM fact_transactions WHERE transaction_date = '2024-03-03'", [])
            .unwrap();
        let stats = refresh_daily_metrics(&mut db.conn, 0, today).unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(dump(&db).len(), 2);
    }

    #[test]
    fn test_zero_prior_wallets_gives_null() {
        let mut rows = vec![
            DailyMetrics {
                unique_wallets: 0,
                ..row("2024-01-01", 0, 0.0)
            },
            row("2024-01-02", 3, 1.0),
        ];
        compute_windows(&mut rows);
        assert_eq!(rows[1].windows.tx_count_change_pct, None);
        assert_eq!(rows[1].windows.value_change_pct, None);
        assert_eq!(rows[1].windows.unique_wallets_change_pct, None);
    }

    fn row(date: &str, total: i64, value: f64) -> DailyMetrics {
        DailyMetrics {
            metric_date: date.to_string(),
            total_transactions: total,
            successful_transactions: total,
            failed_transactions: 0,
            success_rate: 1.0,
            total_value_eth: value,
            avg_value_eth: 0.0,
            min_value_eth: 0.0,
            max_value_eth: 0.0,
            zero_value_transactions: 0,
            micro_transactions: 0,
            small_transactions: 0,
            medium_transactions: 0,
            large_transactions: 0,
            very_large_transactions: 0,
            whale_transactions: 0,
            high_value_transactions: 0,
            contract_creations: 0,
            contract_calls: 0,
            value_transfers: 0,
            total_gas_used: 0,
            avg_gas_used: None,
            avg_gas_price_gwei: None,
            total_gas_cost_eth: 0.0,
            unique_senders: 0,
            unique_receivers: 0,
            unique_wallets: total,
            windows: WindowColumns::default(),
        }
    }
}
