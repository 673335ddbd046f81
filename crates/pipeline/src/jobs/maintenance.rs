use anyhow::Result;
use common::db::AsyncDb;
use serde::Serialize;

use crate::zone_metrics;

/// Count rows per zone table and record them to Prometheus gauges.
pub async fn run_zone_metrics_once(db: &AsyncDb) -> Result<()> {
    let counts = db
        .call_named("zone_metrics.compute", |conn| {
            zone_metrics::compute_zone_counts(conn)
        })
        .await?;
    zone_metrics::record_zone_counts(&counts);
    Ok(())
}

/// Size of the `-wal` file next to `db_path`; 0 when there is none (or for `:memory:`).
pub fn wal_size_bytes(db_path: &str) -> u64 {
    std::fs::metadata(format!("{db_path}-wal")).map_or(0, |m| m.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointOutcome {
    /// WAL size that triggered the checkpoint.
    pub wal_bytes: u64,
    pub log_pages: i64,
    pub checkpointed_pages: i64,
    /// A reader held the WAL; the checkpoint was partial.
    pub busy: bool,
}

/// Fold the WAL back into the main file once a run has grown it to `threshold_bytes`.
///
/// Staging and the analytics merges rewrite whole zones, so one run can leave a WAL
/// many times the size of the rows it changed. TRUNCATE resets the file to zero bytes.
pub async fn checkpoint_after_run(
    db: &AsyncDb,
    db_path: &str,
    threshold_bytes: u64,
) -> Result<Option<CheckpointOutcome>> {
    let wal_bytes = wal_size_bytes(db_path);
    if wal_bytes == 0 || wal_bytes < threshold_bytes {
        return Ok(None);
    }

    let (busy, log_pages, checkpointed_pages) = db
        .call_named("wal_checkpoint.run", |conn| {
            Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?)
        })
        .await?;

    let outcome = CheckpointOutcome {
        wal_bytes,
        log_pages,
        checkpointed_pages,
        busy: busy != 0,
    };
    let status = if outcome.busy { "busy" } else { "ok" };
    metrics::counter!("pipeline_wal_checkpoint_total", "status" => status).increment(1);
    metrics::gauge!("pipeline_wal_checkpoint_pages").set(checkpointed_pages as f64);
    if outcome.busy {
        tracing::warn!(wal_bytes, log_pages, checkpointed_pages, "WAL checkpoint was partial");
    } else {
        tracing::info!(wal_bytes, checkpointed_pages, "WAL checkpoint complete");
    }
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_some_rows(db: &AsyncDb) {
        db.call(|conn| {
            for i in 0..50 {
                conn.execute(
                    "INSERT INTO raw_wallets (wallet_address) VALUES (?1)",
                    [format!("0x{i:040x}")],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_truncates_wal_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        let path = path.to_str().unwrap();
        let db = AsyncDb::open(path).await.unwrap();
        write_some_rows(&db).await;
        assert!(wal_size_bytes(path) > 0);

        let outcome = checkpoint_after_run(&db, path, 1).await.unwrap().unwrap();
        assert!(!outcome.busy);
        assert!(outcome.wal_bytes > 0);
        assert_eq!(wal_size_bytes(path), 0);
    }

    #[tokio::test]
    async fn test_small_wal_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        let path = path.to_str().unwrap();
        let db = AsyncDb::open(path).await.unwrap();
        write_some_rows(&db).await;
        let before = wal_size_bytes(path);

        let outcome = checkpoint_after_run(&db, path, u64::MAX).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(wal_size_bytes(path), before);
    }

    #[tokio::test]
    async fn test_in_memory_database_never_checkpoints() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        assert_eq!(checkpoint_after_run(&db, ":memory:", 0).await.unwrap(), None);
    }
}
