use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::transaction::{OriginMetadata, Transaction};
use crate::types::Money;

/// Derived view of one account: every current transaction where it is sender
/// or receiver, time-ordered. Materialized on demand from a snapshot.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub history: Vec<Arc<Transaction>>,
}

impl Account {
    pub(crate) fn new(id: String, history: Vec<Arc<Transaction>>) -> Self {
        Account { id, history }
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.history
            .iter()
            .map(|t| t.as_ref())
            .filter(move |t| t.sender.account_id == self.id)
    }

    pub fn incoming(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.history
            .iter()
            .map(|t| t.as_ref())
            .filter(move |t| t.receiver.account_id == self.id)
    }

    /// Every name this account has appeared under, as sender or receiver.
    pub fn names(&self) -> BTreeSet<String> {
        self.history
            .iter()
            .flat_map(|t| {
                let mut names = Vec::with_capacity(2);
                if t.sender.account_id == self.id {
                    names.push(normalize_name(&t.sender.name));
                }
                if t.receiver.account_id == self.id {
                    names.push(normalize_name(&t.receiver.name));
                }
                names
            })
            .collect()
    }

    /// Origin metadata of transactions this account initiated.
    pub fn origins(&self) -> Vec<&OriginMetadata> {
        self.outgoing().filter_map(|t| t.origin.as_ref()).collect()
    }

    pub fn total_in(&self) -> Money {
        self.incoming()
            .filter(|t| !t.is_self_transfer())
            .map(|t| t.amount)
            .sum()
    }

    pub fn total_out(&self) -> Money {
        self.outgoing()
            .filter(|t| !t.is_self_transfer())
            .map(|t| t.amount)
            .sum()
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.history.first().map(|t| t.timestamp)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|t| t.timestamp)
    }
}

/// Case- and whitespace-insensitive form of a party name.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == ',' || c == '.'))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::TransactionStore;
    use crate::ledger::transaction::fixtures::tx;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Acme   Corp. "), "acme corp");
        assert_eq!(normalize_name("ACME, Inc."), "acme inc");
    }

    #[test]
    fn test_flows_and_names() {
        let store = TransactionStore::new();
        store.ingest(tx("t1", "A", "B", dec!(100), 0)).unwrap();
        store.ingest(tx("t2", "C", "A", dec!(40), 1)).unwrap();
        let mut alias = tx("t3", "A", "D", dec!(10), 2);
        alias.sender.name = "Someone Else".into();
        store.ingest(alias).unwrap();

        let account = store.snapshot().account("A").unwrap();
        assert_eq!(account.total_out(), dec!(110));
        assert_eq!(account.total_in(), dec!(40));
        assert_eq!(account.names().len(), 2);
        assert!(account.first_seen() < account.last_seen());
    }
}
