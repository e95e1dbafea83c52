use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::{Detector, DetectorReport, PatternKind, PatternMatch};
use crate::config::StructuringConfig;
use crate::ledger::{StoreSnapshot, TimeWindow, Transaction, TransactionType};
use crate::types::{format_amount, Currency, Money, Score};
use crate::AmlResult;

/// Repeated near-threshold cash deposits into one account inside a sliding
/// window.
#[derive(Debug, Clone)]
pub struct StructuringDetector {
    config: StructuringConfig,
}

impl StructuringDetector {
    pub fn new(config: StructuringConfig) -> Self {
        StructuringDetector { config }
    }

    fn band(&self) -> (Money, Money) {
        (
            self.config.threshold * self.config.low_fraction,
            self.config.threshold,
        )
    }

    /// Near-threshold cash deposits credited to `account`, ordered by
    /// (timestamp, id).
    fn candidate_deposits<'a>(
        &self,
        snapshot: &'a StoreSnapshot,
        account: &str,
    ) -> Vec<&'a Arc<Transaction>> {
        let (low, high) = self.band();
        snapshot
            .transactions_for_account(account, TimeWindow::all())
            .filter(|t| {
                t.transaction_type == TransactionType::CashDeposit
                    && t.receiver.account_id == account
                    && t.amount >= low
                    && t.amount < high
            })
            .collect()
    }

    /// Matches for one account. Each currency is scanned on its own; within
    /// it, windows are taken greedily from the earliest deposit and a matched
    /// window's deposits are not reused.
    pub fn scan_account(&self, snapshot: &StoreSnapshot, account: &str) -> Vec<PatternMatch> {
        let mut by_currency: BTreeMap<&Currency, Vec<&Arc<Transaction>>> = BTreeMap::new();
        for deposit in self.candidate_deposits(snapshot, account) {
            by_currency.entry(&deposit.currency).or_default().push(deposit);
        }
        by_currency
            .into_values()
            .flat_map(|deposits| self.scan_deposits(account, &deposits))
            .collect()
    }

    fn scan_deposits(&self, account: &str, deposits: &[&Arc<Transaction>]) -> Vec<PatternMatch> {
        let window = Duration::hours(self.config.window_hours);
        let floor = self.config.threshold * self.config.min_multiplier;

        let mut matches = Vec::new();
        let mut i = 0;
        while i < deposits.len() {
            let end = deposits[i].timestamp + window;
            let mut j = i;
            while j + 1 < deposits.len() && deposits[j + 1].timestamp <= end {
                j += 1;
            }

            let group = &deposits[i..=j];
            let total: Money = group.iter().map(|t| t.amount).sum();
            if group.len() >= self.config.min_count && total > floor {
                let m = self.build_match(account, group, total);
                debug!(account, match_id = %m.id, confidence = %m.confidence, "structuring match");
                matches.push(m);
                i = j + 1;
            } else {
                i += 1;
            }
        }
        matches
    }

    fn build_match(&self, account: &str, group: &[&Arc<Transaction>], total: Money) -> PatternMatch {
        let count = group.len();
        let channels: BTreeSet<String> = group.iter().map(|t| t.channel()).collect();
        let span = group[count - 1].timestamp - group[0].timestamp;

        let confidence = self.confidence(group, span, channels.len());
        let span_hours = (span.num_minutes() + 59) / 60;
        let currency = &group[0].currency;
        let evidence = format!(
            "{} deposits totaling {} across {} channel{} within {}h, each below {}",
            count,
            format_amount(total, currency),
            channels.len(),
            if channels.len() == 1 { "" } else { "s" },
            span_hours,
            format_amount(self.config.threshold, currency),
        );

        PatternMatch::new(
            PatternKind::Structuring,
            group.iter().map(|t| t.id.clone()),
            BTreeSet::from([account.to_string()]),
            confidence,
            evidence,
        )
    }

    /// 0.5 base, up to +0.25 for proximity to the threshold, +0.15 for tight
    /// timing and +0.10 for channel diversity.
    fn confidence(&self, group: &[&Arc<Transaction>], span: Duration, channels: usize) -> Score {
        let (low, high) = self.band();
        let count = Decimal::from(group.len());

        let proximity = group
            .iter()
            .map(|t| (t.amount - low) / (high - low))
            .sum::<Decimal>()
            / count;

        let window_secs = Decimal::from(self.config.window_hours * 3600);
        let tightness =
            (Decimal::ONE - Decimal::from(span.num_seconds()) / window_secs).max(Decimal::ZERO);

        let diversity = if group.len() > 1 {
            Decimal::from(channels - 1) / Decimal::from(group.len() - 1)
        } else {
            Decimal::ZERO
        };

        dec!(0.5) + dec!(0.25) * proximity + dec!(0.15) * tightness + dec!(0.10) * diversity
    }
}

impl Detector for StructuringDetector {
    fn name(&self) -> &'static str {
        "structuring"
    }

    fn kind(&self) -> PatternKind {
        PatternKind::Structuring
    }

    fn detect(&self, snapshot: &StoreSnapshot) -> AmlResult<DetectorReport> {
        let matches = snapshot
            .accounts()
            .flat_map(|account| self.scan_account(snapshot, account))
            .collect();
        Ok(DetectorReport {
            matches,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::transaction::fixtures::{cash, tx};
    use crate::ledger::TransactionStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn detector() -> StructuringDetector {
        StructuringDetector::new(StructuringConfig::default())
    }

    fn branch(mut t: Transaction, branch: &str) -> Transaction {
        t.metadata.insert("branch".into(), json!(branch));
        t
    }

    fn store_with(txs: Vec<Transaction>) -> TransactionStore {
        let store = TransactionStore::new();
        for t in txs {
            store.ingest(t).unwrap();
        }
        store
    }

    #[test]
    fn test_currencies_never_share_a_window() {
        let eur = |mut t: Transaction| {
            t.currency = Currency::EUR;
            t
        };
        let store = store_with(vec![
            cash("d1", "PV", dec!(9900), 0),
            cash("d2", "PV", dec!(9900), 2),
            eur(cash("d3", "PV", dec!(9900), 4)),
            eur(cash("d4", "PV", dec!(9900), 6)),
            eur(cash("d5", "PV", dec!(9900), 8)),
        ]);
        assert!(detector().detect(&store.snapshot()).unwrap().matches.is_empty());

        // A fourth euro deposit lifts the euro-only total over the floor
        store.ingest(eur(cash("d6", "PV", dec!(9900), 10))).unwrap();
        let report = detector().detect(&store.snapshot()).unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].transaction_ids, vec!["d3", "d4", "d5", "d6"]);
        assert!(report.matches[0].evidence.contains("€39,600"));
    }

    #[test]
    fn test_four_near_threshold_deposits_match() {
        let store = store_with(vec![
            branch(cash("d1", "PV", dec!(9800), 0), "Main St"),
            branch(cash("d2", "PV", dec!(9950), 6), "ATM 12"),
            branch(cash("d3", "PV", dec!(9900), 14), "Harbor"),
            branch(cash("d4", "PV", dec!(9850), 25), "Airport"),
        ]);
        let report = detector().detect(&store.snapshot()).unwrap();
        assert_eq!(report.matches.len(), 1);
        let m = &report.matches[0];
        assert_eq!(m.transaction_ids, vec!["d1", "d2", "d3", "d4"]);
        assert_eq!(
            m.evidence,
            "4 deposits totaling $39,500 across 4 channels within 25h, each below $10,000"
        );
        assert!(m.confidence > dec!(0.8));
        assert!(m.confidence <= Decimal::ONE);
    }

    #[test]
    fn test_sum_must_exceed_multiple() {
        // 3 x 9,000 = 27,000 does not exceed 30,000
        let store = store_with(vec![
            cash("d1", "A", dec!(9000), 0),
            cash("d2", "A", dec!(9000), 1),
            cash("d3", "A", dec!(9000), 2),
        ]);
        assert!(detector().detect(&store.snapshot()).unwrap().matches.is_empty());
    }

    #[test]
    fn test_min_count_required() {
        let mut config = StructuringConfig::default();
        config.min_multiplier = dec!(1);
        let store = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(9900), 1),
        ]);
        let detector = StructuringDetector::new(config);
        assert!(detector.detect(&store.snapshot()).unwrap().matches.is_empty());
    }

    #[test]
    fn test_window_boundary_inclusive() {
        let store = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(9900), 20),
            cash("d3", "A", dec!(9900), 30),
            cash("d4", "A", dec!(9900), 48),
        ]);
        let report = detector().detect(&store.snapshot()).unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].transaction_ids.len(), 4);
    }

    #[test]
    fn test_outside_window_excluded() {
        let store = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(9900), 10),
            cash("d3", "A", dec!(9900), 20),
            cash("d4", "A", dec!(9900), 30),
            cash("d5", "A", dec!(9900), 49),
        ]);
        let report = detector().detect(&store.snapshot()).unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].transaction_ids, vec!["d1", "d2", "d3", "d4"]);
    }

    #[test]
    fn test_band_and_type_filters() {
        let mut wire = tx("w1", "B", "A", dec!(9900), 2);
        wire.transaction_type = TransactionType::WireTransfer;
        let store = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(10000), 1),
            wire,
            cash("d3", "A", dec!(8999.99), 3),
            cash("d4", "A", dec!(9950), 4),
        ]);
        assert!(detector().detect(&store.snapshot()).unwrap().matches.is_empty());
    }

    #[test]
    fn test_tight_timing_scores_higher() {
        let tight = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(9900), 1),
            cash("d3", "A", dec!(9900), 2),
            cash("d4", "A", dec!(9900), 3),
        ]);
        let loose = store_with(vec![
            cash("d1", "A", dec!(9900), 0),
            cash("d2", "A", dec!(9900), 15),
            cash("d3", "A", dec!(9900), 30),
            cash("d4", "A", dec!(9900), 45),
        ]);
        let c_tight = detector().detect(&tight.snapshot()).unwrap().matches[0].confidence;
        let c_loose = detector().detect(&loose.snapshot()).unwrap().matches[0].confidence;
        assert!(c_tight > c_loose);
    }

    #[test]
    fn test_timestamp_ties_broken_by_id() {
        let store = store_with(vec![
            cash("d-b", "A", dec!(9900), 0),
            cash("d-a", "A", dec!(9900), 0),
            cash("d-c", "A", dec!(9900), 0),
            cash("d-d", "A", dec!(9900), 0),
        ]);
        let m = &detector().detect(&store.snapshot()).unwrap().matches[0];
        assert_eq!(m.transaction_ids, vec!["d-a", "d-b", "d-c", "d-d"]);
        assert!(m.evidence.contains("1 channel within 0h"));
    }

    #[test]
    fn test_two_separate_bursts() {
        let store = store_with(vec![
            cash("a1", "A", dec!(9900), 0),
            cash("a2", "A", dec!(9900), 1),
            cash("a3", "A", dec!(9900), 2),
            cash("a4", "A", dec!(9900), 3),
            cash("b1", "A", dec!(9900), 100),
            cash("b2", "A", dec!(9900), 101),
            cash("b3", "A", dec!(9900), 102),
            cash("b4", "A", dec!(9900), 103),
        ]);
        let report = detector().detect(&store.snapshot()).unwrap();
        assert_eq!(report.matches.len(), 2);
    }
}
