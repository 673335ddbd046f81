use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use common::config::Policy;
use common::types::{format_date, format_ts, parse_ts, TransactionType};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{
    cast_flag, cast_i64, dedup_latest, is_not_older, non_blank, normalize_address,
    quality_score, resolve_amount, wei_to_eth, write_rejections, Cast, RejectReason, Rejection,
    StageStats,
};

/// One `raw_transactions` row, with numeric columns still as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTransaction {
    pub id: i64,
    pub transaction_hash: Option<String>,
    pub block_number: Option<String>,
    pub block_hash: Option<String>,
    pub transaction_timestamp: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub contract_address: Option<String>,
    pub value_wei: Option<String>,
    pub value_eth: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub gas_used: Option<String>,
    pub nonce: Option<String>,
    pub input_data: Option<String>,
    pub method_id: Option<String>,
    pub function_name: Option<String>,
    pub is_error: Option<String>,
    pub source: Option<String>,
    pub ingested_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedTransaction {
    pub transaction_id: String,
    pub transaction_hash: String,
    pub block_number: i64,
    pub block_hash: Option<String>,
    pub transaction_timestamp: Option<DateTime<Utc>>,
    pub from_address: String,
    pub to_address: Option<String>,
    pub contract_address: Option<String>,
    pub value_wei: Option<Decimal>,
    pub gas_limit: Option<i64>,
    pub gas_price_wei: Option<i64>,
    pub gas_used: Option<i64>,
    pub nonce: Option<i64>,
    pub method_id: Option<String>,
    pub function_name: Option<String>,
    pub transaction_type: TransactionType,
    pub is_contract_creation: bool,
    pub is_contract_interaction: bool,
    pub is_successful: bool,
    pub data_quality_score: f64,
    pub quality_issues: Vec<String>,
    pub source: Option<String>,
    pub raw_id: i64,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl StagedTransaction {
    pub fn value_eth(&self) -> Option<f64> {
        self.value_wei.map(wei_to_eth)
    }

    pub fn gas_cost_eth(&self) -> Option<f64> {
        let used = Decimal::from(self.gas_used?);
        let price = Decimal::from(self.gas_price_wei?);
        used.checked_mul(price).map(wei_to_eth)
    }

    pub fn gas_price_gwei(&self) -> Option<f64> {
        self.gas_price_wei
            .and_then(|p| (Decimal::from(p) / Decimal::from(1_000_000_000_u64)).to_f64())
    }
}

fn has_call_data(input: Option<&str>) -> bool {
    input.is_some_and(|d| d != "0x")
}

/// Ordered rule set, first match wins.
pub fn transaction_type(
    to_address: Option<&str>,
    contract_address: Option<&str>,
    input_data: Option<&str>,
    value_wei: Option<Decimal>,
) -> TransactionType {
    if to_address.is_none() && contract_address.is_some() {
        TransactionType::ContractCreation
    } else if input_data.is_some_and(|d| d != "0x" && d.len() > 10) {
        TransactionType::ContractCall
    } else if value_wei.is_some_and(|v| v > Decimal::ZERO) {
        TransactionType::ValueTransfer
    } else {
        TransactionType::Other
    }
}

/// Cast, classify and score one raw row. Rows that fail hard validity
/// (no hash, no block number, blank sender) come back as a [`Rejection`].
pub fn normalize_transaction(
    raw: &RawTransaction,
    policy: &Policy,
) -> std::result::Result<StagedTransaction, Rejection> {
    let mut issues = Vec::new();

    let hash = normalize_address(raw.transaction_hash.as_deref());
    let from = normalize_address(raw.from_address.as_deref());
    let to = normalize_address(raw.to_address.as_deref());
    let contract = normalize_address(raw.contract_address.as_deref());
    let timestamp = raw.transaction_timestamp.as_deref().and_then(parse_ts);

    let block_number = match cast_i64(raw.block_number.as_deref()) {
        Cast::Value(b) => Some(b),
        Cast::Absent => {
            issues.push("missing_block_number".to_string());
            None
        }
        Cast::Invalid => {
            issues.push("invalid_block_number".to_string());
            None
        }
    };
    if hash.is_none() {
        issues.insert(0, "missing_transaction_hash".to_string());
    }
    if from.is_none() {
        issues.push("missing_from_address".to_string());
    }
    if timestamp.is_none() {
        issues.push("missing_timestamp".to_string());
    }

    let value_wei = resolve_amount(
        raw.value_wei.as_deref(),
        raw.value_eth.as_deref(),
        "value",
        &mut issues,
    );
    let mut int_column = |s: Option<&str>, name: &str| match cast_i64(s) {
        Cast::Invalid => {
            issues.push(format!("invalid_{name}"));
            None
        }
        other => other.value(),
    };
    let gas_limit = int_column(raw.gas.as_deref(), "gas");
    let gas_price_wei = int_column(raw.gas_price.as_deref(), "gas_price");
    let gas_used = int_column(raw.gas_used.as_deref(), "gas_used");
    let nonce = int_column(raw.nonce.as_deref(), "nonce");

    let score = quality_score(hash.is_some(), from.is_some(), timestamp.is_some(), policy);

    let mut reasons = Vec::new();
    if hash.is_none() {
        reasons.push(RejectReason::MissingHash);
    }
    if block_number.is_none() {
        reasons.push(RejectReason::MissingBlockNumber);
    }
    if from.is_none() {
        reasons.push(RejectReason::EmptyFromAddress);
    }
    let (Some(hash), Some(block_number), Some(from)) = (hash.clone(), block_number, from) else {
        return Err(Rejection {
            raw_id: raw.id,
            natural_key: hash,
            reasons,
            quality_issues: issues,
            data_quality_score: Some(score),
        });
    };

    let input = non_blank(raw.input_data.as_deref());
    let is_contract_creation = to.is_none() && contract.is_some();
    let tx_type = transaction_type(
        to.as_deref(),
        contract.as_deref(),
        input.as_deref(),
        value_wei,
    );

    Ok(StagedTransaction {
        transaction_id: format!("{hash}-{block_number}"),
        transaction_hash: hash,
        block_number,
        block_hash: normalize_address(raw.block_hash.as_deref()),
        transaction_timestamp: timestamp,
        from_address: from,
        to_address: to,
        contract_address: contract,
        value_wei,
        gas_limit,
        gas_price_wei,
        gas_used,
        nonce,
        method_id: non_blank(raw.method_id.as_deref()),
        function_name: non_blank(raw.function_name.as_deref()),
        transaction_type: tx_type,
        is_contract_creation,
        is_contract_interaction: has_call_data(input.as_deref()),
        is_successful: !cast_flag(raw.is_error.as_deref()).unwrap_or(false),
        data_quality_score: score,
        quality_issues: issues,
        source: non_blank(raw.source.as_deref()),
        raw_id: raw.id,
        ingested_at: raw.ingested_at.as_deref().and_then(parse_ts),
    })
}

/// Raw rows with `since_id < id <= up_to_id`, plus every other version of the hashes they touch.
fn load_raw_transactions(
    conn: &Connection,
    since_id: i64,
    up_to_id: i64,
) -> Result<Vec<RawTransaction>> {
    let mut stmt = conn.prepare(
        "
        SELECT id, transaction_hash, CAST(block_number AS TEXT), block_hash,
               CAST(transaction_timestamp AS TEXT), from_address, to_address, contract_address,
               CAST(value_wei AS TEXT), CAST(value_eth AS TEXT), CAST(gas AS TEXT),
               CAST(gas_price AS TEXT), CAST(gas_used AS TEXT), CAST(nonce AS TEXT),
               input_data, method_id, function_name, CAST(is_error AS TEXT), source,
               CAST(ingested_at AS TEXT)
        FROM raw_transactions
        WHERE id <= ?2
          AND (
            id > ?1
            OR LOWER(TRIM(transaction_hash)) IN (
                SELECT LOWER(TRIM(transaction_hash))
                FROM raw_transactions
                WHERE id > ?1 AND id <= ?2 AND transaction_hash IS NOT NULL
            )
          )
        ORDER BY id ASC
        ",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![since_id, up_to_id], |row| {
            Ok(RawTransaction {
                id: row.get(0)?,
                transaction_hash: row.get(1)?,
                block_number: row.get(2)?,
                block_hash: row.get(3)?,
                transaction_timestamp: row.get(4)?,
                from_address: row.get(5)?,
                to_address: row.get(6)?,
                contract_address: row.get(7)?,
                value_wei: row.get(8)?,
                value_eth: row.get(9)?,
                gas: row.get(10)?,
                gas_price: row.get(11)?,
                gas_used: row.get(12)?,
                nonce: row.get(13)?,
                input_data: row.get(14)?,
                method_id: row.get(15)?,
                function_name: row.get(16)?,
                is_error: row.get(17)?,
                source: row.get(18)?,
                ingested_at: row.get(19)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_staged(
    tx: &rusqlite::Transaction<'_>,
    s: &StagedTransaction,
    staged_at: &str,
) -> Result<bool> {
    let incoming = s.ingested_at.map(format_ts);
    let stored: Option<Option<String>> = tx
        .query_row(
            "SELECT ingested_at FROM stg_transactions WHERE transaction_hash = ?1",
            [&s.transaction_hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stored) = stored {
        if !is_not_older(incoming.as_deref(), stored.as_deref()) {
            return Ok(false);
        }
    }

    // OR REPLACE also clears a row for the same hash staged under another block number.
    tx.execute(
        "INSERT OR REPLACE INTO stg_transactions (
            transaction_id, transaction_hash, block_number, block_hash,
            transaction_timestamp, transaction_date, transaction_hour,
            from_address, to_address, contract_address,
            value_wei, value_eth, gas_limit, gas_price_wei, gas_price_gwei, gas_used, gas_cost_eth,
            nonce, method_id, function_name, transaction_type,
            is_contract_creation, is_contract_interaction, is_successful,
            data_quality_score, quality_issues, source, raw_id, ingested_at, staged_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        rusqlite::params![
            s.transaction_id,
            s.transaction_hash,
            s.block_number,
            s.block_hash,
            s.transaction_timestamp.map(format_ts),
            s.transaction_timestamp.map(|t| format_date(t.date_naive())),
            s.transaction_timestamp.map(|t| t.hour()),
            s.from_address,
            s.to_address,
            s.contract_address,
            s.value_wei.map(|v| v.to_string()),
            s.value_eth(),
            s.gas_limit,
            s.gas_price_wei,
            s.gas_price_gwei(),
            s.gas_used,
            s.gas_cost_eth(),
            s.nonce,
            s.method_id,
            s.function_name,
            s.transaction_type.as_str(),
            s.is_contract_creation,
            s.is_contract_interaction,
            s.is_successful,
            s.data_quality_score,
            serde_json::to_string(&s.quality_issues)?,
            s.source,
            s.raw_id,
            incoming,
            staged_at,
        ],
    )?;
    Ok(true)
}

/// Stage every transaction hash touched by raw rows in `(since_id, up_to_id]`.
pub fn stage_transactions(
    conn: &mut Connection,
    policy: &Policy,
    since_id: i64,
    up_to_id: i64,
    now: DateTime<Utc>,
) -> Result<StageStats> {
    let raw = load_raw_transactions(conn, since_id, up_to_id)?;
    let mut stats = StageStats {
        raw_rows: raw.len() as u64,
        ..StageStats::default()
    };

    // Rows without a hash cannot be partitioned; each one is its own rejection.
    let (keyed, unkeyed): (Vec<_>, Vec<_>) = raw
        .into_iter()
        .partition(|r| normalize_address(r.transaction_hash.as_deref()).is_some());
    let latest = dedup_latest(
        keyed,
        |r| normalize_address(r.transaction_hash.as_deref()),
        |r| r.ingested_at.as_deref().and_then(parse_ts),
    );
    stats.keys = latest.len() as u64;

    let mut staged = Vec::with_capacity(latest.len());
    let mut rejections = Vec::new();
    for r in unkeyed.iter().filter(|r| r.id > since_id).chain(latest.iter()) {
        match normalize_transaction(r, policy) {
            Ok(s) => staged.push(s),
            Err(rej) => rejections.push(rej),
        }
    }

    let now_s = format_ts(now);
    let tx = conn.transaction()?;
    for s in &staged {
        if upsert_staged(&tx, s, &now_s)? {
            stats.staged += 1;
        } else {
            stats.stale += 1;
        }
    }
    write_rejections(&tx, "transaction", &rejections, &now_s)?;
    tx.commit()?;

    for rej in &rejections {
        let reasons: Vec<String> = rej.reasons.iter().map(ToString::to_string).collect();
        tracing::debug!(raw_id = rej.raw_id, key = ?rej.natural_key, ?reasons, "raw transaction rejected");
    }
    stats.rejected = rejections.len() as u64;
    Ok(stats)
}
