//! False-positive suppression.
//!
//! Scores the transactions behind a match against legitimacy signals and
//! demotes, never deletes, matches that look like ordinary business.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::SuppressionConfig;
use crate::detection::{Annotation, PatternMatch};
use crate::ledger::account::normalize_name;
use crate::ledger::{StoreSnapshot, Transaction, TransactionType};
use crate::types::{clamp_score, Score};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Each signal is the mean over the match's transactions, in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegitimacySignals {
    pub consistent_identity: Score,
    pub invoice_reference: Score,
    pub stable_origin: Score,
    pub business_channel: Score,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegitimacyAssessment {
    pub signals: LegitimacySignals,
    pub score: Score,
}

/// Corporate name suffixes counted as a registered business identity.
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "llc",
    "ltd",
    "limited",
    "plc",
    "gmbh",
    "ag",
    "sa",
    "bv",
    "co",
    "company",
    "industries",
    "manufacturing",
    "solutions",
    "systems",
    "technologies",
];

// ---------------------------------------------------------------------------
// Signal helpers
// ---------------------------------------------------------------------------

fn is_corporate(name: &str) -> bool {
    normalize_name(name)
        .split_whitespace()
        .last()
        .is_some_and(|w| CORPORATE_SUFFIXES.contains(&w))
}

fn has_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

/// `INV-2024-0891`, `PO#44521`, `invoice 4411`, `purchase order 7781`.
pub fn has_invoice_reference(description: &str) -> bool {
    let words: Vec<String> = description
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '(' | ')'))
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    for (i, word) in words.iter().enumerate() {
        for prefix in ["invoice", "inv", "po"] {
            if let Some(rest) = word.strip_prefix(prefix) {
                let joined = rest
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '#' | '/' | '_'));
                if joined && has_digit(rest) {
                    return true;
                }
                if rest.is_empty() || rest == "#" || rest == "." {
                    if words.get(i + 1).is_some_and(|next| has_digit(next)) {
                        return true;
                    }
                }
            }
        }
        if word == "order"
            && i > 0
            && words[i - 1] == "purchase"
            && words.get(i + 1).is_some_and(|next| has_digit(next))
        {
            return true;
        }
    }
    false
}

fn mean(values: impl Iterator<Item = Decimal>) -> Decimal {
    let (sum, n) = values.fold((Decimal::ZERO, 0u32), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        Decimal::ZERO
    } else {
        sum / Decimal::from(n)
    }
}

fn flag(b: bool) -> Decimal {
    if b {
        Decimal::ONE
    } else {
        Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Suppressor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FalsePositiveSuppressor {
    config: SuppressionConfig,
}

impl FalsePositiveSuppressor {
    pub fn new(config: SuppressionConfig) -> Self {
        FalsePositiveSuppressor { config }
    }

    /// 1 when both parties always appear under one name and both are
    /// corporate, 0.5 when consistent but not both corporate.
    fn identity(&self, snapshot: &StoreSnapshot, tx: &Transaction) -> Decimal {
        let consistent = |account: &str| {
            snapshot
                .account(account)
                .is_some_and(|a| a.names().len() == 1)
        };
        let mut parties = vec![&tx.sender];
        if !tx.is_self_transfer() {
            parties.push(&tx.receiver);
        }
        if !parties.iter().all(|p| consistent(&p.account_id)) {
            return Decimal::ZERO;
        }
        if parties.iter().all(|p| is_corporate(&p.name)) {
            Decimal::ONE
        } else {
            Decimal::new(5, 1)
        }
    }

    /// The transaction came from the same IP and device the sender always uses.
    fn stable_origin(&self, snapshot: &StoreSnapshot, tx: &Transaction) -> bool {
        let Some(origin) = tx.origin.as_ref() else {
            return false;
        };
        if origin.ip_address.is_none() || origin.device_id.is_none() {
            return false;
        }
        match snapshot.account(&tx.sender.account_id) {
            Some(account) => account.origins().iter().all(|o| {
                o.ip_address == origin.ip_address && o.device_id == origin.device_id
            }),
            None => false,
        }
    }

    fn business_channel(&self, tx: &Transaction) -> bool {
        let source = tx.source_system.to_lowercase();
        let declared = self
            .config
            .business_channels
            .iter()
            .any(|c| c.to_lowercase() == source);
        declared
            && matches!(
                tx.transaction_type,
                TransactionType::WireTransfer
                    | TransactionType::AchTransfer
                    | TransactionType::InternationalWire
                    | TransactionType::InternalTransfer
            )
    }

    pub fn assess(&self, m: &PatternMatch, snapshot: &StoreSnapshot) -> LegitimacyAssessment {
        let txs: Vec<&Arc<Transaction>> = m
            .transaction_ids
            .iter()
            .filter_map(|id| snapshot.get(id))
            .collect();

        let signals = LegitimacySignals {
            consistent_identity: mean(txs.iter().map(|t| self.identity(snapshot, t))),
            invoice_reference: mean(txs.iter().map(|t| flag(has_invoice_reference(&t.description)))),
            stable_origin: mean(txs.iter().map(|t| flag(self.stable_origin(snapshot, t)))),
            business_channel: mean(txs.iter().map(|t| flag(self.business_channel(t)))),
        };

        let w = &self.config.weights;
        let total = w.consistent_identity + w.invoice_reference + w.stable_origin + w.business_channel;
        let weighted = w.consistent_identity * signals.consistent_identity
            + w.invoice_reference * signals.invoice_reference
            + w.stable_origin * signals.stable_origin
            + w.business_channel * signals.business_channel;
        let score = if total.is_zero() {
            Decimal::ZERO
        } else {
            clamp_score(weighted / total)
        };

        LegitimacyAssessment { signals, score }
    }

    /// Demote `m` when its legitimacy exceeds the threshold: a new revision
    /// with damped confidence, annotated `likely_legitimate`. Otherwise `m`
    /// is returned unchanged.
    pub fn apply(&self, m: PatternMatch, snapshot: &StoreSnapshot) -> PatternMatch {
        if m.is_likely_legitimate() {
            return m;
        }
        let assessment = self.assess(&m, snapshot);
        if assessment.score <= self.config.legitimacy_threshold {
            return m;
        }

        let mut reasons = Vec::new();
        let s = &assessment.signals;
        if s.consistent_identity > Decimal::ZERO {
            reasons.push("consistent identity");
        }
        if s.invoice_reference > Decimal::ZERO {
            reasons.push("invoice/PO reference");
        }
        if s.stable_origin > Decimal::ZERO {
            reasons.push("stable origin");
        }
        if s.business_channel > Decimal::ZERO {
            reasons.push("business channel");
        }

        let mut demoted = m.revise().with_annotation(Annotation::LikelyLegitimate);
        demoted.confidence = clamp_score(m.confidence * self.config.damping_factor);
        demoted.evidence = format!(
            "{}; likely legitimate (legitimacy {}: {})",
            m.evidence,
            assessment.score.round_dp(2),
            reasons.join(", ")
        );
        debug!(
            match_id = %demoted.id,
            supersedes = %m.id,
            legitimacy = %assessment.score,
            "match demoted as likely legitimate"
        );
        demoted
    }
}
