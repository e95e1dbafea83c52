//! Versioned wire records exchanged with ingestion adapters and case
//! consumers. Internal types stay free to change; these do not.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::aggregation::Case;
use crate::error::AmlError;
use crate::ledger::{OriginMetadata, Party, Transaction, TransactionType};
use crate::types::{Currency, Money};
use crate::AmlResult;

/// Record schema version for both input batches and the case feed.
pub const SCHEMA_VERSION: &str = "aml.v1";

const SCHEMA_MAJOR: &str = "aml.v1";

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyRecord {
    #[serde(default)]
    pub name: String,
    #[serde(alias = "account_number", alias = "account")]
    pub account_id: String,
}

/// One transaction as submitted by an ingestion adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(alias = "id")]
    pub transaction_id: String,
    /// RFC 3339 with any offset, or naive (assumed UTC)
    pub timestamp: String,
    pub amount: Money,
    #[serde(default)]
    pub currency: String,
    pub sender: PartyRecord,
    pub receiver: PartyRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
    #[serde(default)]
    pub source_system: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Anything outside the documented fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Input envelope: `{"schema_version": "aml.v1", "transactions": [...]}`.
///
/// Records stay untyped until ingestion so one malformed entry is rejected
/// on its own instead of failing the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

impl TransactionBatch {
    pub fn check_version(&self) -> AmlResult<()> {
        match &self.schema_version {
            None => Ok(()),
            Some(v) if v == SCHEMA_MAJOR || v.starts_with(&format!("{SCHEMA_MAJOR}.")) => Ok(()),
            Some(v) => Err(AmlError::invalid_record(
                "schema_version",
                format!("Unsupported schema version '{v}' (expected {SCHEMA_VERSION})"),
            )),
        }
    }

    pub fn from_records(records: &[TransactionRecord]) -> AmlResult<Self> {
        let transactions = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransactionBatch {
            schema_version: Some(SCHEMA_VERSION.to_string()),
            transactions,
        })
    }
}

/// Best-effort id of a raw record, for reporting rejections.
pub fn raw_record_id(raw: &Value) -> Option<String> {
    raw.get("transaction_id")
        .or_else(|| raw.get("id"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

impl TransactionRecord {
    pub fn from_value(raw: &Value) -> AmlResult<Self> {
        if !raw.is_object() {
            return Err(AmlError::invalid_record(
                "record",
                "Transaction record must be a JSON object",
            ));
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| AmlError::invalid_record("record", e.to_string()))
    }

    /// Normalize into the internal model: UTC timestamp, typed currency,
    /// unknown fields folded into `metadata`.
    pub fn into_transaction(self) -> AmlResult<Transaction> {
        let id = self.transaction_id.trim().to_string();
        if id.is_empty() {
            return Err(AmlError::invalid_record(
                "transaction_id",
                "Transaction id must not be empty",
            ));
        }
        let timestamp = parse_timestamp(&self.timestamp)?;
        let sender = party(self.sender, "sender")?;
        let receiver = party(self.receiver, "receiver")?;

        let mut metadata = self.metadata;
        for (key, value) in self.extra {
            metadata.entry(key).or_insert(value);
        }

        // Origin fields may also arrive flattened at the top level.
        let origin = self.origin.or_else(|| {
            let field = |key: &str| {
                metadata
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let origin = OriginMetadata {
                ip_address: field("ip_address"),
                device_id: field("device_id"),
                geolocation: field("geolocation"),
            };
            (origin != OriginMetadata::default()).then_some(origin)
        });

        Ok(Transaction {
            id,
            timestamp,
            amount: self.amount,
            currency: Currency::from_code(&self.currency),
            sender,
            receiver,
            transaction_type: self.transaction_type.unwrap_or(TransactionType::Other),
            source_system: self.source_system,
            description: self.description,
            origin,
            supersedes: self
                .supersedes
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            metadata,
        })
    }
}

impl From<&Transaction> for TransactionRecord {
    fn from(tx: &Transaction) -> Self {
        TransactionRecord {
            transaction_id: tx.id.clone(),
            timestamp: tx.timestamp.to_rfc3339(),
            amount: tx.amount,
            currency: tx.currency.to_string(),
            sender: PartyRecord {
                name: tx.sender.name.clone(),
                account_id: tx.sender.account_id.clone(),
            },
            receiver: PartyRecord {
                name: tx.receiver.name.clone(),
                account_id: tx.receiver.account_id.clone(),
            },
            transaction_type: Some(tx.transaction_type),
            source_system: tx.source_system.clone(),
            description: tx.description.clone(),
            origin: tx.origin.clone(),
            supersedes: tx.supersedes.clone(),
            metadata: tx.metadata.clone(),
            extra: BTreeMap::new(),
        }
    }
}

fn party(record: PartyRecord, side: &str) -> AmlResult<Party> {
    let account_id = record.account_id.trim().to_string();
    if account_id.is_empty() {
        return Err(AmlError::invalid_record(
            &format!("{side}.account_id"),
            "Account id must not be empty",
        ));
    }
    let name = match record.name.trim() {
        "" => account_id.clone(),
        name => name.to_string(),
    };
    Ok(Party { name, account_id })
}

/// Parse an RFC 3339 or naive ISO 8601 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> AmlResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(AmlError::invalid_record(
        "timestamp",
        format!("Unparseable timestamp '{raw}'"),
    ))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Accepted,
    Duplicate,
    Rejected,
}

/// Per-record outcome of batch ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub transaction_id: Option<String>,
    pub status: IngestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IngestResult {
    pub fn accepted(id: String) -> Self {
        IngestResult {
            transaction_id: Some(id),
            status: IngestStatus::Accepted,
            reason: None,
        }
    }

    pub fn from_error(id: Option<String>, err: &AmlError) -> Self {
        let status = match err {
            AmlError::DuplicateId { .. } => IngestStatus::Duplicate,
            _ => IngestStatus::Rejected,
        };
        IngestResult {
            transaction_id: id,
            status,
            reason: Some(err.to_string()),
        }
    }
}

/// Case feed consumed by external case management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseFeed {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub cases: Vec<Case>,
}

impl CaseFeed {
    pub fn new(cases: Vec<Case>) -> Self {
        CaseFeed {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            cases,
        }
    }
}
