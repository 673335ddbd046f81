use anyhow::Result;
use rusqlite::Connection;

/// Row counts per zone table, recorded as `pipeline_zone_rows{zone, table}` gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneCounts {
    pub tables: Vec<TableCount>,
    /// Raw rows past the last successful run's high-water marks.
    pub raw_backlog: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    pub zone: &'static str,
    pub table: &'static str,
    pub rows: i64,
}

const ZONE_TABLES: &[(&str, &str)] = &[
    ("raw", "raw_transactions"),
    ("raw", "raw_wallets"),
    ("staging", "stg_transactions"),
    ("staging", "stg_wallets"),
    ("staging", "stg_rejections"),
    ("analytics", "dim_time"),
    ("analytics", "dim_wallet"),
    ("analytics", "fact_transactions"),
    ("analytics", "agg_daily_metrics"),
    ("ml", "ml_wallet_fraud_scores"),
];

pub fn compute_zone_counts(conn: &Connection) -> Result<ZoneCounts> {
    let mut tables = Vec::with_capacity(ZONE_TABLES.len());
    for &(zone, table) in ZONE_TABLES {
        // Table names come from the fixed list above.
        let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        tables.push(TableCount { zone, table, rows });
    }

    let raw_backlog: i64 = conn.query_row(
        "WITH hw AS (
            SELECT COALESCE(MAX(raw_transactions_high_water), 0) AS tx,
                   COALESCE(MAX(raw_wallets_high_water), 0) AS w
            FROM pipeline_runs WHERE status = 'success'
         )
         SELECT (SELECT COUNT(*) FROM raw_transactions, hw WHERE id > hw.tx)
              + (SELECT COUNT(*) FROM raw_wallets, hw WHERE id > hw.w)",
        [],
        |r| r.get(0),
    )?;

    Ok(ZoneCounts {
        tables,
        raw_backlog,
    })
}

pub fn record_zone_counts(counts: &ZoneCounts) {
    for t in &counts.tables {
        metrics::gauge!("pipeline_zone_rows", "zone" => t.zone, "table" => t.table)
            .set(t.rows as f64);
    }
    metrics::gauge!("pipeline_raw_backlog_rows").set(counts.raw_backlog as f64);
}
