//! Raw → staging: dedup by natural key (latest `ingested_at` wins), normalize,
//! classify, score, and drop rows that fail hard validity.

mod transactions;
mod wallets;

pub use transactions::stage_transactions;
pub use wallets::stage_wallets;

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config::Policy;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Why a raw row was dropped instead of staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("transaction hash is null or blank")]
    MissingHash,
    #[error("block number is null or not an integer")]
    MissingBlockNumber,
    #[error("from_address is empty after trim")]
    EmptyFromAddress,
    #[error("wallet_address is empty after trim")]
    EmptyWalletAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub raw_id: i64,
    pub natural_key: Option<String>,
    pub reasons: Vec<RejectReason>,
    pub quality_issues: Vec<String>,
    pub data_quality_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StageStats {
    /// Raw rows read (all versions of every touched key).
    pub raw_rows: u64,
    /// Distinct natural keys after dedup.
    pub keys: u64,
    /// Rows written to the staging table.
    pub staged: u64,
    /// Keys whose stored staging row was at least as recent as the incoming one.
    pub stale: u64,
    pub rejected: u64,
}

/// Keep one row per key: the one with the greatest ingestion timestamp.
///
/// The sort is stable, so among rows with equal timestamps the first in input
/// order wins. Rows without a parseable timestamp rank below all others.
pub fn dedup_latest<T, K, FK, FT>(mut rows: Vec<T>, key: FK, ingested_at: FT) -> Vec<T>
where
    K: Ord,
    FK: Fn(&T) -> K,
    FT: Fn(&T) -> Option<DateTime<Utc>>,
{
    rows.sort_by(|a, b| {
        key(a)
            .cmp(&key(b))
            .then_with(|| ingested_at(b).cmp(&ingested_at(a)))
    });
    rows.dedup_by(|later, kept| key(later) == key(kept));
    rows
}

/// Step function over presence of the required fields.
pub fn quality_score(has_hash: bool, has_from: bool, has_timestamp: bool, policy: &Policy) -> f64 {
    if !has_hash {
        policy.quality_score_missing_hash
    } else if !has_from || !has_timestamp {
        policy.quality_score_partial
    } else {
        policy.quality_score_complete
    }
}

/// Trim + lowercase; blank becomes `None`.
pub fn normalize_address(s: Option<&str>) -> Option<String> {
    let t = s?.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_ascii_lowercase())
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    let t = s?.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Outcome of casting an optional numeric string.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cast<T> {
    Absent,
    Invalid,
    Value(T),
}

impl<T> Cast<T> {
    fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

fn cast_i64(s: Option<&str>) -> Cast<i64> {
    let Some(t) = s.map(str::trim).filter(|t| !t.is_empty()) else {
        return Cast::Absent;
    };
    let parsed = match t.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => t.parse::<i64>().ok().or_else(|| {
            // "21000.0" from sources that round-trip through floats
            t.parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .and_then(|f| f.to_i64())
        }),
    };
    match parsed {
        Some(v) if v >= 0 => Cast::Value(v),
        _ => Cast::Invalid,
    }
}

/// Non-negative decimal; accepts plain and scientific notation.
fn cast_decimal(s: Option<&str>) -> Cast<Decimal> {
    let Some(t) = s.map(str::trim).filter(|t| !t.is_empty()) else {
        return Cast::Absent;
    };
    match Decimal::from_str(t).or_else(|_| Decimal::from_scientific(t)) {
        Ok(d) if !d.is_sign_negative() => Cast::Value(d),
        _ => Cast::Invalid,
    }
}

fn cast_f64(s: Option<&str>) -> Cast<f64> {
    let Some(t) = s.map(str::trim).filter(|t| !t.is_empty()) else {
        return Cast::Absent;
    };
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() => Cast::Value(v),
        _ => Cast::Invalid,
    }
}

fn cast_flag(s: Option<&str>) -> Option<bool> {
    let t = s?.trim().to_ascii_lowercase();
    match t.as_str() {
        "1" | "true" | "t" | "yes" => Some(true),
        "0" | "false" | "f" | "no" | "" => Some(false),
        _ => None,
    }
}

fn wei_per_eth() -> Decimal {
    Decimal::from(1_000_000_000_000_000_000_u64)
}

pub fn wei_to_eth(wei: Decimal) -> f64 {
    (wei / wei_per_eth()).to_f64().unwrap_or(0.0)
}

/// Resolve an amount given as wei and/or ETH strings. Wei is authoritative;
/// ETH is only used to derive wei when wei is absent.
fn resolve_amount(
    wei: Option<&str>,
    eth: Option<&str>,
    column: &str,
    issues: &mut Vec<String>,
) -> Option<Decimal> {
    match cast_decimal(wei) {
        Cast::Value(w) => return Some(w.trunc()),
        Cast::Invalid => issues.push(format!("invalid_{column}_wei")),
        Cast::Absent => {}
    }
    match cast_decimal(eth) {
        Cast::Value(e) => e.checked_mul(wei_per_eth()).map(|w| w.trunc()),
        Cast::Invalid => {
            issues.push(format!("invalid_{column}_eth"));
            None
        }
        Cast::Absent => None,
    }
}

/// True when a row ingested at `incoming` may replace the stored staging row.
fn is_not_older(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (incoming, stored) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(i), Some(s)) => i >= s,
    }
}

fn write_rejections(
    tx: &rusqlite::Transaction<'_>,
    entity: &str,
    rejections: &[Rejection],
    now: &str,
) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO stg_rejections
            (entity, raw_id, natural_key, quality_issues, data_quality_score, rejected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for r in rejections {
        stmt.execute(rusqlite::params![
            entity,
            r.raw_id,
            r.natural_key,
            serde_json::to_string(&r.quality_issues)?,
            r.data_quality_score,
            now,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::parse_ts;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        key: &'static str,
        at: Option<&'static str>,
    }

    fn rows(spec: &[(i64, &'static str, Option<&'static str>)]) -> Vec<Row> {
        spec.iter()
            .map(|&(id, key, at)| Row { id, key, at })
            .collect()
    }

    fn dedup(input: Vec<Row>) -> Vec<i64> {
        dedup_latest(input, |r| r.key, |r| r.at.and_then(parse_ts))
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[test]
    fn test_dedup_keeps_latest_ingested_per_key() {
        let input = rows(&[
            (1, "a", Some("2024-01-01 00:00:00")),
            (2, "b", Some("2024-01-01 00:00:00")),
            (3, "a", Some("2024-01-03 00:00:00")),
            (4, "a", Some("2024-01-02 00:00:00")),
        ]);
        assert_eq!(dedup(input), vec![3, 2]);
    }

    #[test]
    fn test_dedup_ties_keep_first_in_input_order() {
        let input = rows(&[
            (7, "a", Some("2024-01-01 00:00:00")),
            (8, "a", Some("2024-01-01 00:00:00")),
        ]);
        assert_eq!(dedup(input), vec![7]);
    }

    #[test]
    fn test_dedup_unparseable_timestamp_ranks_last() {
        let input = rows(&[(1, "a", Some("garbage")), (2, "a", Some("2020-01-01"))]);
        // "2020-01-01" is not a timestamp either → both None → first wins.
        assert_eq!(dedup(input), vec![1]);

        let input = rows(&[(1, "a", None), (2, "a", Some("2020-01-01 00:00:00"))]);
        assert_eq!(dedup(input), vec![2]);
    }

    #[test]
    fn test_quality_score_step_function() {
        let p = Policy::default();
        assert!((quality_score(false, true, true, &p) - 0.0).abs() < f64::EPSILON);
        assert!((quality_score(true, false, true, &p) - 0.5).abs() < f64::EPSILON);
        assert!((quality_score(true, true, false, &p) - 0.5).abs() < f64::EPSILON);
        assert!((quality_score(true, true, true, &p) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_casts() {
        assert_eq!(cast_i64(Some(" 21000 ")), Cast::Value(21000));
        assert_eq!(cast_i64(Some("0x5208")), Cast::Value(21000));
        assert_eq!(cast_i64(Some("21000.0")), Cast::Value(21000));
        assert_eq!(cast_i64(Some("-1")), Cast::Invalid);
        assert_eq!(cast_i64(Some("abc")), Cast::Invalid);
        assert_eq!(cast_i64(Some("  ")), Cast::Absent);
        assert_eq!(cast_i64(None), Cast::Absent);

        assert_eq!(
            cast_decimal(Some("1000000000000000000000")),
            Cast::Value(Decimal::from_str("1000000000000000000000").unwrap())
        );
        assert_eq!(
            cast_decimal(Some("1e21")),
            Cast::Value(Decimal::from_str("1000000000000000000000").unwrap())
        );
        assert_eq!(cast_decimal(Some("-5")), Cast::Invalid);

        assert_eq!(cast_flag(Some("TRUE")), Some(true));
        assert_eq!(cast_flag(Some("0")), Some(false));
        assert_eq!(cast_flag(None), None);
    }

    #[test]
    fn test_resolve_amount_prefers_wei_and_derives_from_eth() {
        let mut issues = Vec::new();
        let w = resolve_amount(Some("500000000000000"), Some("99"), "value", &mut issues);
        assert_eq!(w, Some(Decimal::from(500_000_000_000_000_u64)));
        assert!(issues.is_empty());

        let w = resolve_amount(None, Some("0.0005"), "value", &mut issues);
        assert_eq!(w, Some(Decimal::from(500_000_000_000_000_u64)));
        assert!((wei_to_eth(w.unwrap()) - 0.0005).abs() < 1e-12);

        let w = resolve_amount(Some("lots"), None, "value", &mut issues);
        assert_eq!(w, None);
        assert_eq!(issues, vec!["invalid_value_wei".to_string()]);
    }

    #[test]
    fn test_is_not_older() {
        assert!(is_not_older(Some("2024-01-02"), Some("2024-01-01")));
        assert!(is_not_older(Some("2024-01-01"), Some("2024-01-01")));
        assert!(!is_not_older(Some("2023-12-31"), Some("2024-01-01")));
        assert!(is_not_older(None, None));
        assert!(!is_not_older(None, Some("2024-01-01")));
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(Some("  0xAbC ")),
            Some("0xabc".to_string())
        );
        assert_eq!(normalize_address(Some("   ")), None);
        assert_eq!(normalize_address(None), None);
    }
}
