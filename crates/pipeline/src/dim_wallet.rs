//! SCD Type 2 wallet dimension.
//!
//! Versions live in an arena keyed by `(address, version)`. A tracked change is
//! two explicit operations, [`WalletHistory::expire`] then [`WalletHistory::open`],
//! recorded in order and replayed against SQLite inside one transaction.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use anyhow::{Context, Result};
use common::types::WalletType;
use rusqlite::Connection;
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScdError {
    #[error("wallet {0} has no current version to expire")]
    NoCurrentVersion(String),
    #[error("wallet {address} already has current version {version}")]
    AlreadyCurrent { address: String, version: i64 },
}

/// A stored column that cannot be read back into a [`WalletAttributes`] field.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ColumnError {
    #[error("balance_wei {0:?} is not a decimal")]
    Balance(String),
    #[error("unknown wallet_type {0:?}")]
    WalletType(String),
    #[error("transaction counters {tx_in} + {tx_out} overflow")]
    CounterOverflow { tx_in: i64, tx_out: i64 },
}

fn conversion(idx: usize, err: ColumnError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn balance_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|_| conversion(idx, ColumnError::Balance(s)))
}

fn wallet_type_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<WalletType> {
    let s: String = row.get(idx)?;
    WalletType::parse(&s).ok_or_else(|| conversion(idx, ColumnError::WalletType(s)))
}

/// Attributes carried by each version.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAttributes {
    pub balance_wei: Decimal,
    pub balance_eth: f64,
    pub total_transactions: i64,
    pub total_transactions_in: i64,
    pub total_transactions_out: i64,
    pub total_value_in_eth: f64,
    pub total_value_out_eth: f64,
    pub unique_counterparties: i64,
    pub wallet_type: WalletType,
    pub is_contract: bool,
    pub first_seen_at: Option<String>,
    pub last_seen_at: Option<String>,
}

impl WalletAttributes {
    /// True when a tracked attribute differs. Other columns ride along with the next version.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.balance_wei != other.balance_wei
            || self.total_transactions != other.total_transactions
            || self.wallet_type != other.wallet_type
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletVersion {
    pub address: String,
    pub version: i64,
    pub attributes: WalletAttributes,
    pub valid_from: String,
    pub valid_to: Option<String>,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScdOp {
    Expire { address: String, version: i64 },
    Open { address: String, version: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Inserted,
    Versioned,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DimWalletStats {
    pub wallets: u64,
    pub inserted: u64,
    pub versioned: u64,
    pub unchanged: u64,
}

#[derive(Debug, Default)]
pub struct WalletHistory {
    versions: BTreeMap<(String, i64), WalletVersion>,
    current: HashMap<String, i64>,
    ops: Vec<ScdOp>,
}

impl WalletHistory {
    fn seed(&mut self, v: WalletVersion) {
        if v.is_current {
            self.current.insert(v.address.clone(), v.version);
        }
        self.versions.insert((v.address.clone(), v.version), v);
    }

    pub fn current(&self, address: &str) -> Option<&WalletVersion> {
        let version = *self.current.get(address)?;
        self.versions.get(&(address.to_string(), version))
    }

    /// All known versions of `address`, oldest first.
    pub fn versions<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a WalletVersion> {
        self.versions
            .values()
            .filter(move |v| v.address == address)
    }

    fn next_version(&self, address: &str) -> i64 {
        self.versions
            .range((address.to_string(), i64::MIN)..=(address.to_string(), i64::MAX))
            .next_back()
            .map_or(1, |((_, v), _)| v + 1)
    }

    /// Close the current version of `address` at `at`.
    pub fn expire(&mut self, address: &str, at: &str) -> std::result::Result<i64, ScdError> {
        let version = self
            .current
            .remove(address)
            .ok_or_else(|| ScdError::NoCurrentVersion(address.to_string()))?;
        if let Some(v) = self.versions.get_mut(&(address.to_string(), version)) {
            v.is_current = false;
            v.valid_to = Some(at.to_string());
        }
        self.ops.push(ScdOp::Expire {
            address: address.to_string(),
            version,
        });
        Ok(version)
    }

    /// Open a new current version. Fails if one is still open.
    pub fn open(
        &mut self,
        address: &str,
        attributes: WalletAttributes,
        at: &str,
    ) -> std::result::Result<i64, ScdError> {
        if let Some(&version) = self.current.get(address) {
            return Err(ScdError::AlreadyCurrent {
                address: address.to_string(),
                version,
            });
        }
        let version = self.next_version(address);
        self.seed(WalletVersion {
            address: address.to_string(),
            version,
            attributes,
            valid_from: at.to_string(),
            valid_to: None,
            is_current: true,
        });
        self.ops.push(ScdOp::Open {
            address: address.to_string(),
            version,
        });
        Ok(version)
    }

    pub fn apply(
        &mut self,
        address: &str,
        attributes: WalletAttributes,
        at: &str,
    ) -> std::result::Result<Change, ScdError> {
        match self.current(address) {
            None => {
                self.open(address, attributes, at)?;
                Ok(Change::Inserted)
            }
            Some(cur) if !cur.attributes.differs_from(&attributes) => Ok(Change::Unchanged),
            Some(_) => {
                self.expire(address, at)?;
                self.open(address, attributes, at)?;
                Ok(Change::Versioned)
            }
        }
    }

    /// Write pending operations in the order they were recorded.
    fn persist(&mut self, tx: &rusqlite::Transaction<'_>) -> Result<()> {
        for op in self.ops.drain(..) {
            match op {
                ScdOp::Expire { address, version } => {
                    let v = self
                        .versions
                        .get(&(address.clone(), version))
                        .with_context(|| format!("expired version {address}#{version} missing"))?;
                    let n = tx.execute(
                        "UPDATE dim_wallet SET is_current = 0, valid_to = ?3
                         WHERE wallet_address = ?1 AND version = ?2 AND is_current = 1",
                        rusqlite::params![address, version, v.valid_to],
                    )?;
                    anyhow::ensure!(n == 1, "wallet {address}#{version} was not current");
                }
                ScdOp::Open { address, version } => {
                    let v = self
                        .versions
                        .get(&(address.clone(), version))
                        .with_context(|| format!("opened version {address}#{version} missing"))?;
                    insert_version(tx, v)?;
                }
            }
        }
        Ok(())
    }
}

fn insert_version(tx: &rusqlite::Transaction<'_>, v: &WalletVersion) -> Result<()> {
    let a = &v.attributes;
    tx.execute(
        "INSERT INTO dim_wallet (
            wallet_address, version, balance_wei, balance_eth, total_transactions,
            total_transactions_in, total_transactions_out, total_value_in_eth,
            total_value_out_eth, unique_counterparties, wallet_type, is_contract,
            first_seen_at, last_seen_at, valid_from, valid_to, is_current
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        rusqlite::params![
            v.address,
            v.version,
            a.balance_wei.to_string(),
            a.balance_eth,
            a.total_transactions,
            a.total_transactions_in,
            a.total_transactions_out,
            a.total_value_in_eth,
            a.total_value_out_eth,
            a.unique_counterparties,
            a.wallet_type.as_str(),
            a.is_contract,
            a.first_seen_at,
            a.last_seen_at,
            v.valid_from,
            v.valid_to,
            v.is_current,
        ],
    )?;
    Ok(())
}

const VERSION_COLUMNS: &str = "wallet_address, version, balance_wei, balance_eth, total_transactions,
    total_transactions_in, total_transactions_out, total_value_in_eth, total_value_out_eth,
    unique_counterparties, wallet_type, is_contract, first_seen_at, last_seen_at,
    valid_from, valid_to, is_current";

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletVersion> {
    Ok(WalletVersion {
        address: row.get(0)?,
        version: row.get(1)?,
        attributes: WalletAttributes {
            balance_wei: balance_column(row, 2)?,
            balance_eth: row.get(3)?,
            total_transactions: row.get(4)?,
            total_transactions_in: row.get(5)?,
            total_transactions_out: row.get(6)?,
            total_value_in_eth: row.get(7)?,
            total_value_out_eth: row.get(8)?,
            unique_counterparties: row.get(9)?,
            wallet_type: wallet_type_column(row, 10)?,
            is_contract: row.get(11)?,
            first_seen_at: row.get(12)?,
            last_seen_at: row.get(13)?,
        },
        valid_from: row.get(14)?,
        valid_to: row.get(15)?,
        is_current: row.get(16)?,
    })
}

/// Load every current version plus the latest version number per address.
fn load_current(conn: &Connection) -> Result<WalletHistory> {
    let mut history = WalletHistory::default();
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM dim_wallet
         WHERE is_current = 1
            OR version = (SELECT MAX(version) FROM dim_wallet d2
                          WHERE d2.wallet_address = dim_wallet.wallet_address)"
    ))?;
    let rows = stmt.query_map([], version_from_row)?;
    for row in rows {
        history.seed(row.context("reading dim_wallet")?);
    }
    Ok(history)
}

type StagedAttributes = (String, WalletAttributes);

fn load_staged_wallets(
    conn: &Connection,
    staged_since: Option<&str>,
) -> Result<Vec<StagedAttributes>> {
    let mut stmt = conn.prepare(
        "SELECT wallet_address, balance_wei, balance_eth, total_transactions_in,
                total_transactions_out, total_value_in_eth, total_value_out_eth,
                unique_counterparties, wallet_type, is_contract, first_seen_at, last_seen_at
         FROM stg_wallets
         WHERE ?1 IS NULL OR staged_at >= ?1
         ORDER BY wallet_address",
    )?;
    let rows = stmt
        .query_map([staged_since], |row| {
            let tx_in: i64 = row.get(3)?;
            let tx_out: i64 = row.get(4)?;
            let total = tx_in
                .checked_add(tx_out)
                .ok_or_else(|| conversion(3, ColumnError::CounterOverflow { tx_in, tx_out }))?;
            Ok((
                row.get::<_, String>(0)?,
                WalletAttributes {
                    balance_wei: balance_column(row, 1)?,
                    balance_eth: row.get(2)?,
                    total_transactions: total,
                    total_transactions_in: tx_in,
                    total_transactions_out: tx_out,
                    total_value_in_eth: row.get(5)?,
                    total_value_out_eth: row.get(6)?,
                    unique_counterparties: row.get(7)?,
                    wallet_type: wallet_type_column(row, 8)?,
                    is_contract: row.get(9)?,
                    first_seen_at: row.get(10)?,
                    last_seen_at: row.get(11)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("reading stg_wallets")?;
    Ok(rows)
}

/// Apply staged wallets (all, or those staged at/after `staged_since`) to the dimension.
pub fn merge_dim_wallet(
    conn: &mut Connection,
    staged_since: Option<&str>,
    now: &str,
) -> Result<DimWalletStats> {
    let tx = conn.transaction()?;
    let mut history = load_current(&tx)?;
    let staged = load_staged_wallets(&tx, staged_since)?;

    let mut stats = DimWalletStats {
        wallets: staged.len() as u64,
        ..DimWalletStats::default()
    };
    for (address, attributes) in staged {
        match history.apply(&address, attributes, now)? {
            Change::Inserted => stats.inserted += 1,
            Change::Versioned => stats.versioned += 1,
            Change::Unchanged => stats.unchanged += 1,
        }
    }
    history.persist(&tx)?;
    tx.commit()?;
    Ok(stats)
}

/// Every version of one wallet, in `valid_from` order.
pub fn wallet_history(conn: &Connection, address: &str) -> Result<Vec<WalletVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM dim_wallet
         WHERE wallet_address = ?1
         ORDER BY valid_from ASC, version ASC"
    ))?;
    let rows = stmt
        .query_map([address.trim().to_ascii_lowercase()], version_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("reading dim_wallet history for {address}"))?;
    Ok(rows)
}
