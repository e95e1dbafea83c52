use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ledger::{Transaction, TransactionType};
use crate::types::Score;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Risk signal carried by a single hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMarker {
    JurisdictionCrossing,
    InternationalWire,
    OffshoreJurisdiction,
    NewlyCreatedEntity,
    RegisteredAgent,
    OffshoreEntity,
}

impl RiskMarker {
    pub fn describe(&self) -> &'static str {
        match self {
            RiskMarker::JurisdictionCrossing => "jurisdiction crossing",
            RiskMarker::InternationalWire => "international wire",
            RiskMarker::OffshoreJurisdiction => "offshore jurisdiction",
            RiskMarker::NewlyCreatedEntity => "newly created receiver",
            RiskMarker::RegisteredAgent => "registered-agent receiver",
            RiskMarker::OffshoreEntity => "offshore receiver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: Score) -> RiskLevel {
        if score >= dec!(0.75) {
            RiskLevel::Critical
        } else if score >= dec!(0.50) {
            RiskLevel::High
        } else if score >= dec!(0.25) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Source of jurisdiction and shell-entity signals. Swap the implementation
/// to back it with an external risk feed.
pub trait RiskPolicy: Send + Sync {
    /// Sender and receiver sit in different known jurisdictions.
    fn crosses_jurisdiction(&self, tx: &Transaction) -> bool;

    /// Jurisdiction of either side, or the origin, is on the offshore list.
    fn offshore_jurisdiction(&self, tx: &Transaction) -> bool;

    /// Shell-entity markers on the receiving account.
    fn receiver_markers(&self, tx: &Transaction) -> BTreeSet<RiskMarker>;

    fn reduced_traceability(&self, tx: &Transaction) -> bool {
        tx.transaction_type == TransactionType::InternationalWire
    }

    /// Every marker of one hop.
    fn markers(&self, tx: &Transaction) -> BTreeSet<RiskMarker> {
        let mut markers = self.receiver_markers(tx);
        if self.crosses_jurisdiction(tx) {
            markers.insert(RiskMarker::JurisdictionCrossing);
        }
        if self.reduced_traceability(tx) {
            markers.insert(RiskMarker::InternationalWire);
        }
        if self.offshore_jurisdiction(tx) {
            markers.insert(RiskMarker::OffshoreJurisdiction);
        }
        markers
    }
}

/// Offshore financial centres and secrecy jurisdictions (representative subset).
const OFFSHORE_JURISDICTIONS: &[&str] = &[
    "cyprus",
    "cayman islands",
    "british virgin islands",
    "bvi",
    "panama",
    "seychelles",
    "belize",
    "marshall islands",
    "bermuda",
    "bahamas",
    "isle of man",
    "jersey",
    "guernsey",
    "liechtenstein",
    "mauritius",
    "samoa",
    "vanuatu",
    "anguilla",
    "labuan",
];

/// Receiver-name fragments typical of formation agents and nominee vehicles.
const SHELL_NAME_KEYWORDS: &[&str] = &[
    "incorporators",
    "registered agent",
    "formation",
    "nominee",
    "offshore",
    "trust services",
];

/// Default policy: metadata tags, origin geolocation and static lists.
///
/// Reads `sender_jurisdiction`, `receiver_jurisdiction` and `receiver_tags`
/// metadata; falls back to the origin country for the sender side.
#[derive(Debug, Clone, Default)]
pub struct StaticRiskPolicy;

fn normalize_jurisdiction(j: &str) -> String {
    j.trim().to_lowercase()
}

/// Whole-name match against the offshore list. Only the last comma segment
/// counts, so "St Helier, Jersey" matches and "New Jersey" does not.
fn is_offshore(jurisdiction: &str) -> bool {
    let j = normalize_jurisdiction(jurisdiction);
    let country = j.rsplit(',').next().unwrap_or_default().trim();
    let country = country.strip_prefix("the ").unwrap_or(country);
    OFFSHORE_JURISDICTIONS.contains(&country)
}

fn sender_jurisdiction(tx: &Transaction) -> Option<String> {
    tx.metadata_str("sender_jurisdiction")
        .or_else(|| tx.origin.as_ref().and_then(|o| o.country()))
        .map(normalize_jurisdiction)
}

fn receiver_jurisdiction(tx: &Transaction) -> Option<String> {
    tx.metadata_str("receiver_jurisdiction")
        .map(normalize_jurisdiction)
}

impl RiskPolicy for StaticRiskPolicy {
    fn crosses_jurisdiction(&self, tx: &Transaction) -> bool {
        match (sender_jurisdiction(tx), receiver_jurisdiction(tx)) {
            (Some(from), Some(to)) => from != to,
            _ => false,
        }
    }

    fn offshore_jurisdiction(&self, tx: &Transaction) -> bool {
        let origin_country = tx.origin.as_ref().and_then(|o| o.country());
        [
            sender_jurisdiction(tx).as_deref(),
            receiver_jurisdiction(tx).as_deref(),
            origin_country,
        ]
        .into_iter()
        .flatten()
        .any(is_offshore)
    }

    fn receiver_markers(&self, tx: &Transaction) -> BTreeSet<RiskMarker> {
        let mut markers = BTreeSet::new();
        for tag in tx.metadata_tags("receiver_tags") {
            match tag.replace([' ', '-'], "_").as_str() {
                "newly_created" | "new_account" | "new_entity" => {
                    markers.insert(RiskMarker::NewlyCreatedEntity);
                }
                "registered_agent" | "shell" | "shell_company" => {
                    markers.insert(RiskMarker::RegisteredAgent);
                }
                "offshore" => {
                    markers.insert(RiskMarker::OffshoreEntity);
                }
                _ => {}
            }
        }

        let name = tx.receiver.name.to_lowercase();
        if SHELL_NAME_KEYWORDS.iter().any(|&k| name.contains(k)) {
            markers.insert(RiskMarker::RegisteredAgent);
        }
        if receiver_jurisdiction(tx).is_some_and(|j| is_offshore(&j)) {
            markers.insert(RiskMarker::OffshoreEntity);
        }
        markers
    }
}

/// Confidence contribution of a chain's markers: 0.1 each, at most 0.3.
pub fn marker_bonus(markers: &BTreeSet<RiskMarker>) -> Decimal {
    (Decimal::from(markers.len()) * dec!(0.1)).min(dec!(0.3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::transaction::fixtures::tx;
    use crate::ledger::OriginMetadata;
    use serde_json::json;

    #[test]
    fn test_risk_level_cutoffs() {
        assert_eq!(RiskLevel::from_score(dec!(0.1)), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(dec!(0.25)), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(dec!(0.5)), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(dec!(0.75)), RiskLevel::Critical);
        assert!(RiskLevel::Critical > RiskLevel::Low);
    }

    #[test]
    fn test_jurisdiction_crossing_from_metadata() {
        let policy = StaticRiskPolicy;
        let mut t = tx("t1", "A", "B", dec!(100), 0);
        assert!(!policy.crosses_jurisdiction(&t));
        t.metadata.insert("sender_jurisdiction".into(), json!("Germany"));
        t.metadata.insert("receiver_jurisdiction".into(), json!("germany "));
        assert!(!policy.crosses_jurisdiction(&t));
        t.metadata.insert("receiver_jurisdiction".into(), json!("France"));
        assert!(policy.crosses_jurisdiction(&t));
    }

    #[test]
    fn test_origin_country_marks_offshore() {
        let policy = StaticRiskPolicy;
        let mut t = tx("t1", "A", "B", dec!(100), 0);
        t.origin = Some(OriginMetadata {
            geolocation: Some("Limassol, Cyprus".into()),
            ..Default::default()
        });
        let markers = policy.markers(&t);
        assert!(markers.contains(&RiskMarker::OffshoreJurisdiction));
        assert!(!markers.contains(&RiskMarker::JurisdictionCrossing));
    }

    #[test]
    fn test_receiver_markers_from_tags_and_name() {
        let policy = StaticRiskPolicy;
        let mut t = tx("t1", "A", "B", dec!(100), 0);
        t.receiver.name = "Offshore Incorporators Ltd".into();
        t.metadata
            .insert("receiver_tags".into(), json!(["newly created"]));
        let markers = policy.receiver_markers(&t);
        assert!(markers.contains(&RiskMarker::RegisteredAgent));
        assert!(markers.contains(&RiskMarker::NewlyCreatedEntity));
    }

    #[test]
    fn test_international_wire_is_reduced_traceability() {
        let policy = StaticRiskPolicy;
        let mut t = tx("t1", "A", "B", dec!(100), 0);
        assert!(policy.markers(&t).is_empty());
        t.transaction_type = TransactionType::InternationalWire;
        assert_eq!(
            policy.markers(&t).into_iter().collect::<Vec<_>>(),
            vec![RiskMarker::InternationalWire]
        );
    }

    #[test]
    fn test_offshore_list_matches_whole_names() {
        assert!(is_offshore("Jersey"));
        assert!(is_offshore("St Helier, Jersey"));
        assert!(is_offshore("The Bahamas"));
        assert!(is_offshore(" CAYMAN ISLANDS "));
        assert!(!is_offshore("New Jersey"));
        assert!(!is_offshore("American Samoa"));
        assert!(!is_offshore("Trenton, New Jersey"));
        assert!(!is_offshore("Panama City, Florida"));
    }

    #[test]
    fn test_domestic_state_names_carry_no_markers() {
        let policy = StaticRiskPolicy;
        let mut t = tx("t1", "A", "B", dec!(100), 0);
        t.metadata.insert("sender_jurisdiction".into(), json!("New Jersey"));
        t.metadata.insert("receiver_jurisdiction".into(), json!("New Jersey"));
        assert!(policy.markers(&t).is_empty());
    }

    #[test]
    fn test_marker_bonus_capped() {
        let all: BTreeSet<RiskMarker> = [
            RiskMarker::JurisdictionCrossing,
            RiskMarker::InternationalWire,
            RiskMarker::OffshoreEntity,
            RiskMarker::RegisteredAgent,
        ]
        .into_iter()
        .collect();
        assert_eq!(marker_bonus(&all), dec!(0.3));
        assert_eq!(marker_bonus(&BTreeSet::new()), dec!(0));
    }
}
