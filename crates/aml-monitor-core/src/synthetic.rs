//! Seeded synthetic transaction generators for stress tests and demos.
//!
//! The same seed always yields the same batch.

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;

use crate::ledger::TransactionType;
use crate::schema::{PartyRecord, TransactionBatch, TransactionRecord};
use crate::AmlResult;

const FIRST_NAMES: &[&str] = &[
    "Ana", "Ben", "Chloe", "Dmitri", "Elena", "Farid", "Grace", "Hugo", "Ines", "Jonas",
];
const LAST_NAMES: &[&str] = &[
    "Alvarez", "Brooks", "Chen", "Dubois", "Eriksen", "Fischer", "Garcia", "Haddad",
];
const JURISDICTIONS: &[&str] = &["United States", "Cyprus", "Panama", "Germany", "Cayman Islands"];
const BRANCHES: &[&str] = &["Main St", "Harbor", "Airport", "ATM 12", "ATM 31", "Mall Kiosk"];

#[derive(Debug, Clone)]
pub struct SyntheticBatch {
    pub batch: TransactionBatch,
    /// Accounts carrying a planted pattern
    pub planted_accounts: Vec<String>,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn account_id(i: usize) -> String {
    format!("SYN-{i:05}")
}

fn holder(rng: &mut StdRng) -> String {
    format!(
        "{} {}",
        FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())],
        LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())]
    )
}

/// Whole-cent amount drawn uniformly from `[low, high)` dollars.
fn amount(rng: &mut StdRng, low: i64, high: i64) -> Decimal {
    Decimal::new(rng.gen_range(low * 100..high * 100), 2)
}

struct RecordSpec {
    id: String,
    at: DateTime<Utc>,
    amount: Decimal,
    sender: PartyRecord,
    receiver: PartyRecord,
    transaction_type: TransactionType,
    source_system: &'static str,
    metadata: BTreeMap<String, serde_json::Value>,
}

fn record(spec: RecordSpec) -> TransactionRecord {
    TransactionRecord {
        transaction_id: spec.id,
        timestamp: spec.at.to_rfc3339_opts(SecondsFormat::Secs, true),
        amount: spec.amount,
        currency: "USD".to_string(),
        sender: spec.sender,
        receiver: spec.receiver,
        transaction_type: Some(spec.transaction_type),
        source_system: spec.source_system.to_string(),
        description: String::new(),
        origin: None,
        supersedes: None,
        metadata: spec.metadata,
        extra: BTreeMap::new(),
    }
}

/// Densely connected wire network: `accounts` accounts each sending
/// `per_account` transfers to random counterparties inside a two day span.
/// About a quarter of the transfers cross jurisdictions, so the layering
/// search has markers to chase everywhere.
pub fn dense_graph(accounts: usize, per_account: usize, seed: u64) -> AmlResult<SyntheticBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let accounts = accounts.max(2);
    let names: Vec<String> = (0..accounts).map(|_| holder(&mut rng)).collect();
    let base = base_time();

    let mut records = Vec::with_capacity(accounts * per_account);
    for from in 0..accounts {
        for k in 0..per_account {
            let mut to = rng.gen_range(0..accounts - 1);
            if to >= from {
                to += 1;
            }
            let mut metadata = BTreeMap::new();
            if rng.gen_bool(0.25) {
                metadata.insert(
                    "sender_jurisdiction".to_string(),
                    json!(JURISDICTIONS[rng.gen_range(1..JURISDICTIONS.len())]),
                );
                metadata.insert("receiver_jurisdiction".to_string(), json!(JURISDICTIONS[0]));
            }
            records.push(record(RecordSpec {
                id: format!("DG-{from:05}-{k:03}"),
                at: base + Duration::minutes(rng.gen_range(0..48 * 60)),
                amount: amount(&mut rng, 1_000, 100_000),
                sender: PartyRecord {
                    name: names[from].clone(),
                    account_id: account_id(from),
                },
                receiver: PartyRecord {
                    name: names[to].clone(),
                    account_id: account_id(to),
                },
                transaction_type: TransactionType::WireTransfer,
                source_system: "core_banking",
                metadata,
            }));
        }
    }

    Ok(SyntheticBatch {
        batch: TransactionBatch::from_records(&records)?,
        planted_accounts: Vec::new(),
    })
}

/// Cash deposit traffic where roughly half the accounts carry a structuring
/// burst: four to six deposits just under $10,000 within 40 hours. The rest
/// make a few ordinary deposits.
pub fn structuring_bursts(accounts: usize, seed: u64) -> AmlResult<SyntheticBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base = base_time();
    let mut records = Vec::new();
    let mut planted = Vec::new();

    for i in 0..accounts {
        let party = PartyRecord {
            name: holder(&mut rng),
            account_id: account_id(i),
        };
        let start = base + Duration::hours(rng.gen_range(0..24 * 7));
        let burst = rng.gen_bool(0.5);
        let (count, span_minutes) = if burst {
            planted.push(party.account_id.clone());
            (rng.gen_range(4..=6), 40 * 60)
        } else {
            (rng.gen_range(2..=3), 14 * 24 * 60)
        };

        for k in 0..count {
            let value = if burst {
                amount(&mut rng, 9_100, 10_000)
            } else {
                amount(&mut rng, 200, 5_000)
            };
            let mut metadata = BTreeMap::new();
            metadata.insert(
                "branch".to_string(),
                json!(BRANCHES[rng.gen_range(0..BRANCHES.len())]),
            );
            records.push(record(RecordSpec {
                id: format!("SB-{i:05}-{k:02}"),
                at: start + Duration::minutes(rng.gen_range(0..span_minutes)),
                amount: value,
                sender: party.clone(),
                receiver: party.clone(),
                transaction_type: TransactionType::CashDeposit,
                source_system: "branch_teller",
                metadata,
            }));
        }
    }

    Ok(SyntheticBatch {
        batch: TransactionBatch::from_records(&records)?,
        planted_accounts: planted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_batch() {
        let a = dense_graph(10, 5, 42).unwrap();
        let b = dense_graph(10, 5, 42).unwrap();
        assert_eq!(a.batch.transactions, b.batch.transactions);
        assert_eq!(a.batch.transactions.len(), 50);
    }

    #[test]
    fn test_dense_graph_has_no_self_transfers() {
        let g = dense_graph(3, 20, 7).unwrap();
        for raw in &g.batch.transactions {
            assert_ne!(raw["sender"]["account_id"], raw["receiver"]["account_id"]);
        }
    }

    #[test]
    fn test_bursts_are_near_threshold() {
        let s = structuring_bursts(20, 9).unwrap();
        assert!(!s.planted_accounts.is_empty());
        let planted = &s.planted_accounts[0];
        let deposits: Vec<_> = s
            .batch
            .transactions
            .iter()
            .filter(|r| r["receiver"]["account_id"] == planted.as_str())
            .collect();
        assert!(deposits.len() >= 4);
        for d in deposits {
            let value: Decimal = serde_json::from_value(d["amount"].clone()).unwrap();
            assert!(value >= Decimal::from(9_100) && value < Decimal::from(10_000));
        }
    }
}
