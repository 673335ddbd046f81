use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Classification of a staged transaction. Rules are evaluated top-down, first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ContractCreation,
    ContractCall,
    ValueTransfer,
    Other,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContractCreation => "contract_creation",
            Self::ContractCall => "contract_call",
            Self::ValueTransfer => "value_transfer",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletType {
    Contract,
    MinimalActivity,
    Whale,
    ReceiveOnly,
    SendOnly,
    Active,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::MinimalActivity => "minimal_activity",
            Self::Whale => "whale",
            Self::ReceiveOnly => "receive_only",
            Self::SendOnly => "send_only",
            Self::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contract" => Some(Self::Contract),
            "minimal_activity" => Some(Self::MinimalActivity),
            "whale" => Some(Self::Whale),
            "receive_only" => Some(Self::ReceiveOnly),
            "send_only" => Some(Self::SendOnly),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

/// Bucketed classification of a transaction's ETH value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueTier {
    Zero,
    Micro,
    Small,
    Medium,
    Large,
    VeryLarge,
    Whale,
}

impl ValueTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Micro => "micro",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::VeryLarge => "very_large",
            Self::Whale => "whale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Canonical text form for timestamps written by the pipeline.
///
/// Fixed width with microseconds, so lexicographic order equals chronological
/// order. Merge guards (`loaded_at`, staged `ingested_at`) compare these strings in SQL.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// `YYYYMMDD` integer key used by `dim_time` and the fact table.
pub fn time_key(d: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(d.year()) * 10_000 + i64::from(d.month()) * 100 + i64::from(d.day())
}

/// Parse the timestamp shapes the ingester is known to write: RFC3339,
/// `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]` (naive, UTC) and unix seconds.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = s.parse().ok()?;
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    // Some sources append a zone name ("2024-01-01 00:00:00 UTC").
    let trimmed = s.strip_suffix(" UTC")?;
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}
