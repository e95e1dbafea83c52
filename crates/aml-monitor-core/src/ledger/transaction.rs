use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Currency, Money};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum TransactionType {
    CashDeposit,
    CashWithdrawal,
    WireTransfer,
    AchTransfer,
    InternationalWire,
    CardPayment,
    InternalTransfer,
    Other,
}

impl From<String> for TransactionType {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "cash_deposit" | "deposit" => TransactionType::CashDeposit,
            "cash_withdrawal" | "withdrawal" => TransactionType::CashWithdrawal,
            "wire_transfer" | "wire" => TransactionType::WireTransfer,
            "ach_transfer" | "ach" => TransactionType::AchTransfer,
            "international_wire" | "swift" => TransactionType::InternationalWire,
            "card_payment" => TransactionType::CardPayment,
            "internal_transfer" => TransactionType::InternalTransfer,
            _ => TransactionType::Other,
        }
    }
}

impl TransactionType {
    pub fn is_cash(&self) -> bool {
        matches!(
            self,
            TransactionType::CashDeposit | TransactionType::CashWithdrawal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::CashDeposit => "cash_deposit",
            TransactionType::CashWithdrawal => "cash_withdrawal",
            TransactionType::WireTransfer => "wire_transfer",
            TransactionType::AchTransfer => "ach_transfer",
            TransactionType::InternationalWire => "international_wire",
            TransactionType::CardPayment => "card_payment",
            TransactionType::InternalTransfer => "internal_transfer",
            TransactionType::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// One side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub account_id: String,
}

/// Where a transaction was initiated. Absent for cash, ATM and SWIFT-only flows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Free-form location, conventionally "City, Country"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<String>,
}

impl OriginMetadata {
    /// Country part of the geolocation (last comma-separated segment).
    pub fn country(&self) -> Option<&str> {
        self.geolocation
            .as_deref()
            .and_then(|g| g.rsplit(',').next())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// An ingested transaction. Immutable once accepted by the store; corrections
/// arrive as new records carrying `supersedes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: Money,
    pub currency: Currency,
    pub sender: Party,
    pub receiver: Party,
    pub transaction_type: TransactionType,
    pub source_system: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginMetadata>,
    /// Id of the earlier record this one revises
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    /// Fields outside the documented schema, preserved verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Transaction {
    /// Sender and receiver are the same account (e.g. cash into one's own account).
    pub fn is_self_transfer(&self) -> bool {
        self.sender.account_id == self.receiver.account_id
    }

    pub fn involves(&self, account_id: &str) -> bool {
        self.sender.account_id == account_id || self.receiver.account_id == account_id
    }

    /// The other account of a transfer seen from `account_id`.
    pub fn counterparty_of(&self, account_id: &str) -> Option<&Party> {
        if self.is_self_transfer() {
            None
        } else if self.sender.account_id == account_id {
            Some(&self.receiver)
        } else if self.receiver.account_id == account_id {
            Some(&self.sender)
        } else {
            None
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// String entries of a metadata array (e.g. `receiver_tags`).
    pub fn metadata_tags(&self, key: &str) -> Vec<String> {
        match self.metadata.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_lowercase())
                .collect(),
            Some(serde_json::Value::String(s)) => s
                .split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Deposit channel: explicit `channel` / `branch` metadata, else the
    /// source system qualified by origin location.
    pub fn channel(&self) -> String {
        if let Some(channel) = self
            .metadata_str("channel")
            .or_else(|| self.metadata_str("branch"))
        {
            return channel.to_lowercase();
        }
        match self.origin.as_ref().and_then(|o| o.geolocation.as_deref()) {
            Some(location) => format!(
                "{}@{}",
                self.source_system.to_lowercase(),
                location.to_lowercase()
            ),
            None => self.source_system.to_lowercase(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_type_serde_snake_case() {
        let t: TransactionType = serde_json::from_str("\"international_wire\"").unwrap();
        assert_eq!(t, TransactionType::InternationalWire);
        let unknown: TransactionType = serde_json::from_str("\"crypto_swap\"").unwrap();
        assert_eq!(unknown, TransactionType::Other);
        assert_eq!(
            serde_json::to_string(&TransactionType::CashDeposit).unwrap(),
            "\"cash_deposit\""
        );
    }

    #[test]
    fn test_self_transfer_and_counterparty() {
        let deposit = cash("c1", "ACC-1", dec!(9800), 0);
        assert!(deposit.is_self_transfer());
        assert!(deposit.counterparty_of("ACC-1").is_none());

        let wire = tx("w1", "A", "B", dec!(500), 0);
        assert!(!wire.is_self_transfer());
        assert_eq!(wire.counterparty_of("A").unwrap().account_id, "B");
        assert_eq!(wire.counterparty_of("B").unwrap().account_id, "A");
        assert!(wire.counterparty_of("C").is_none());
    }

    #[test]
    fn test_origin_country() {
        let origin = OriginMetadata {
            geolocation: Some("Limassol, Cyprus".into()),
            ..Default::default()
        };
        assert_eq!(origin.country(), Some("Cyprus"));
        assert_eq!(OriginMetadata::default().country(), None);
    }

    #[test]
    fn test_channel_prefers_metadata() {
        let mut deposit = cash("c1", "ACC-1", dec!(9800), 0);
        assert_eq!(deposit.channel(), "branch_teller");
        deposit
            .metadata
            .insert("branch".into(), serde_json::json!("Downtown ATM"));
        assert_eq!(deposit.channel(), "downtown atm");
    }

    #[test]
    fn test_metadata_tags_array_and_csv() {
        let mut t = tx("w1", "A", "B", dec!(500), 0);
        t.metadata.insert(
            "receiver_tags".into(),
            serde_json::json!(["Newly_Created", "offshore"]),
        );
        assert_eq!(t.metadata_tags("receiver_tags"), vec!["newly_created", "offshore"]);
        t.metadata
            .insert("receiver_tags".into(), serde_json::json!("registered_agent, shell"));
        assert_eq!(
            t.metadata_tags("receiver_tags"),
            vec!["registered_agent", "shell"]
        );
    }
}
