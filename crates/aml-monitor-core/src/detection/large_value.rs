use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use tracing::debug;

use super::{Detector, DetectorReport, PatternKind, PatternMatch};
use crate::config::LargeValueConfig;
use crate::ledger::{StoreSnapshot, Transaction};
use crate::types::{format_amount, Score};
use crate::AmlResult;

/// Single transfers at or above the reporting threshold.
#[derive(Debug, Clone)]
pub struct LargeValueDetector {
    config: LargeValueConfig,
}

impl LargeValueDetector {
    pub fn new(config: LargeValueConfig) -> Self {
        LargeValueDetector { config }
    }

    /// 0.35 at the threshold, rising linearly to 0.60 at twice the threshold.
    fn confidence(&self, tx: &Transaction) -> Score {
        let threshold = self.config.reporting_threshold;
        let excess = ((tx.amount - threshold) / threshold).min(Decimal::ONE);
        dec!(0.35) + dec!(0.25) * excess
    }
}

impl Detector for LargeValueDetector {
    fn name(&self) -> &'static str {
        "large_value"
    }

    fn kind(&self) -> PatternKind {
        PatternKind::LargeValue
    }

    fn detect(&self, snapshot: &StoreSnapshot) -> AmlResult<DetectorReport> {
        let threshold = self.config.reporting_threshold;
        let mut report = DetectorReport::default();
        for tx in snapshot.current_transactions() {
            if tx.is_self_transfer() || tx.amount < threshold {
                continue;
            }
            let evidence = format!(
                "{} {} of {} from {} to {}, at or above the {} reporting threshold",
                tx.transaction_type.as_str(),
                tx.id,
                format_amount(tx.amount, &tx.currency),
                tx.sender.name,
                tx.receiver.name,
                format_amount(threshold, &tx.currency),
            );
            let m = PatternMatch::new(
                PatternKind::LargeValue,
                [tx.id.clone()],
                BTreeSet::from([tx.sender.account_id.clone(), tx.receiver.account_id.clone()]),
                self.confidence(tx),
                evidence,
            );
            debug!(match_id = %m.id, transaction_id = %tx.id, "large value match");
            report.matches.push(m);
        }
        Ok(report)
    }
}
