use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::btree_map::Range;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use super::account::Account;
use super::transaction::Transaction;
use crate::error::AmlError;
use crate::AmlResult;

type HistoryKey = (DateTime<Utc>, String);
type History = BTreeMap<HistoryKey, Arc<Transaction>>;

// ---------------------------------------------------------------------------
// Time window
// ---------------------------------------------------------------------------

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeWindow { start, end }
    }

    pub fn all() -> Self {
        TimeWindow {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

// ---------------------------------------------------------------------------
// Lazy account iterator
// ---------------------------------------------------------------------------

/// Time-ordered transactions of one account inside a window, ties broken by
/// transaction id. Clone it to restart the iteration.
#[derive(Clone)]
pub struct AccountWindow<'a> {
    range: Option<Range<'a, HistoryKey, Arc<Transaction>>>,
    end: DateTime<Utc>,
}

impl<'a> AccountWindow<'a> {
    fn empty() -> Self {
        AccountWindow {
            range: None,
            end: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl<'a> Iterator for AccountWindow<'a> {
    type Item = &'a Arc<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.range.as_mut()?;
        match range.next() {
            Some(((ts, _), tx)) if *ts <= self.end => Some(tx),
            _ => {
                self.range = None;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct LedgerState {
    /// Every accepted record, including superseded revisions
    records: BTreeMap<String, Arc<Transaction>>,
    /// Current (non-superseded) records per involved account
    by_account: BTreeMap<String, History>,
    /// old id -> id of the record that revises it
    superseded_by: BTreeMap<String, String>,
    /// Log entries applied so far
    sequence: u64,
}

impl LedgerState {
    fn index(&mut self, tx: &Arc<Transaction>) {
        let key = (tx.timestamp, tx.id.clone());
        self.by_account
            .entry(tx.sender.account_id.clone())
            .or_default()
            .insert(key.clone(), Arc::clone(tx));
        if !tx.is_self_transfer() {
            self.by_account
                .entry(tx.receiver.account_id.clone())
                .or_default()
                .insert(key, Arc::clone(tx));
        }
    }

    fn unindex(&mut self, tx: &Transaction) {
        let key = (tx.timestamp, tx.id.clone());
        for account in [&tx.sender.account_id, &tx.receiver.account_id] {
            if let Some(history) = self.by_account.get_mut(account) {
                history.remove(&key);
            }
        }
    }

    fn apply(&mut self, tx: Arc<Transaction>) {
        if let Some(old_id) = &tx.supersedes {
            self.superseded_by.insert(old_id.clone(), tx.id.clone());
            if let Some(old) = self.records.get(old_id).cloned() {
                self.unindex(&old);
            }
        }

        // A revision may arrive before the record it replaces.
        if !self.superseded_by.contains_key(&tx.id) {
            self.index(&tx);
        }

        self.records.insert(tx.id.clone(), tx);
        self.sequence += 1;
    }
}

/// Accepted records in arrival order. Only ever appended to.
#[derive(Debug, Default)]
struct IngestLog {
    ids: BTreeSet<String>,
    entries: Vec<Arc<Transaction>>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Result of a successful `ingest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub transaction_id: String,
    /// Position in the ingestion order (1-based)
    pub sequence: u64,
}

/// Append-only transaction store.
///
/// `ingest` only appends to the log, so a write never copies existing state
/// no matter how many snapshots are alive. The account index is brought up
/// to date when a snapshot is taken: the indexed view is updated in place
/// when no older snapshot still holds it, and copied once otherwise.
/// Snapshots taken with no write in between share one view.
#[derive(Debug, Default)]
pub struct TransactionStore {
    log: RwLock<IngestLog>,
    view: Mutex<Arc<LedgerState>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append one transaction.
    pub fn ingest(&self, tx: Transaction) -> AmlResult<IngestReceipt> {
        if tx.id.trim().is_empty() {
            return Err(AmlError::invalid_record(
                "transaction_id",
                "Transaction id must not be empty",
            ));
        }
        if tx.amount <= Decimal::ZERO {
            return Err(AmlError::InvalidAmount {
                id: tx.id.clone(),
                amount: tx.amount,
            });
        }
        if tx.sender.account_id.trim().is_empty() || tx.receiver.account_id.trim().is_empty() {
            return Err(AmlError::invalid_record(
                "account_id",
                "Sender and receiver account ids must not be empty",
            ));
        }
        if tx.supersedes.as_deref() == Some(tx.id.as_str()) {
            return Err(AmlError::invalid_record(
                "supersedes",
                "A record cannot supersede itself",
            ));
        }

        let mut log = self.log.write();
        if log.ids.contains(&tx.id) {
            return Err(AmlError::DuplicateId { id: tx.id });
        }

        let transaction_id = tx.id.clone();
        log.ids.insert(transaction_id.clone());
        log.entries.push(Arc::new(tx));
        let sequence = log.entries.len() as u64;
        debug!(transaction_id = %transaction_id, sequence, "transaction ingested");

        Ok(IngestReceipt {
            transaction_id,
            sequence,
        })
    }

    /// Immutable view of everything ingested so far.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut view = self.view.lock();
        let pending: Vec<Arc<Transaction>> = {
            let log = self.log.read();
            log.entries
                .get(view.sequence as usize..)
                .map(<[Arc<Transaction>]>::to_vec)
                .unwrap_or_default()
        };
        if !pending.is_empty() {
            let state = Arc::make_mut(&mut *view);
            for tx in pending {
                state.apply(tx);
            }
        }
        StoreSnapshot {
            state: Arc::clone(&view),
        }
    }

    pub fn len(&self) -> usize {
        self.log.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.log.read().ids.contains(id)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time, read-only view of the store handed to detectors.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    state: Arc<LedgerState>,
}

impl StoreSnapshot {
    /// Number of records ingested when the snapshot was taken.
    pub fn sequence(&self) -> u64 {
        self.state.sequence
    }

    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Transaction>> {
        self.state.records.get(id)
    }

    /// Not revised by a later record.
    pub fn is_current(&self, id: &str) -> bool {
        self.state.records.contains_key(id) && !self.state.superseded_by.contains_key(id)
    }

    pub fn superseded_by(&self, id: &str) -> Option<&str> {
        self.state.superseded_by.get(id).map(String::as_str)
    }

    /// Accounts with at least one current transaction, in id order.
    pub fn accounts(&self) -> impl Iterator<Item = &str> + '_ {
        self.state
            .by_account
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(id, _)| id.as_str())
    }

    /// Current transactions of `account_id` within `window`, lazily, ordered
    /// by (timestamp, id).
    pub fn transactions_for_account(&self, account_id: &str, window: TimeWindow) -> AccountWindow<'_> {
        if window.start > window.end {
            return AccountWindow::empty();
        }
        match self.state.by_account.get(account_id) {
            Some(history) => AccountWindow {
                range: Some(history.range((
                    Bound::Included((window.start, String::new())),
                    Bound::Unbounded,
                ))),
                end: window.end,
            },
            None => AccountWindow::empty(),
        }
    }

    /// Distinct accounts that exchanged funds with `account_id` in its
    /// current history. Superseded revisions do not count.
    pub fn counterparties(&self, account_id: &str) -> BTreeSet<String> {
        self.transactions_for_account(account_id, TimeWindow::all())
            .filter_map(|tx| tx.counterparty_of(account_id))
            .map(|party| party.account_id.clone())
            .collect()
    }

    /// All current transactions ordered by (timestamp, id).
    pub fn current_transactions(&self) -> Vec<&Arc<Transaction>> {
        let mut current: Vec<&Arc<Transaction>> = self
            .state
            .records
            .values()
            .filter(|tx| !self.state.superseded_by.contains_key(&tx.id))
            .collect();
        current.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        current
    }

    /// Materialize the derived account view.
    pub fn account(&self, account_id: &str) -> Option<Account> {
        let history: Vec<Arc<Transaction>> = self
            .transactions_for_account(account_id, TimeWindow::all())
            .cloned()
            .collect();
        if history.is_empty() {
            None
        } else {
            Some(Account::new(account_id.to_string(), history))
        }
    }
}
