//! Versioned engine configuration.
//!
//! Every detector receives its section at construction; there are no rule
//! thresholds hidden in detector code.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::AmlError;
use crate::types::{Money, Score};
use crate::AmlResult;

/// Current configuration schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Upper bound for every hour-valued window (ten years).
pub const MAX_WINDOW_HOURS: i64 = 24 * 366 * 10;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Configuration schema version (must equal `CONFIG_VERSION`)
    pub version: u32,
    pub structuring: StructuringConfig,
    pub layering: LayeringConfig,
    pub large_value: LargeValueConfig,
    pub suppression: SuppressionConfig,
    pub aggregation: AggregationConfig,
}

/// Repeated near-threshold cash deposits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuringConfig {
    /// Sliding window length in hours
    pub window_hours: i64,
    /// Reporting threshold deposits try to stay under, applied in each
    /// deposit's own currency; deposits in different currencies never share
    /// a window
    pub threshold: Money,
    /// Lower bound of the near-threshold band, as a fraction of `threshold`
    pub low_fraction: Decimal,
    /// Window total must exceed `threshold * min_multiplier`
    pub min_multiplier: Decimal,
    /// Minimum number of near-threshold deposits in the window
    pub min_count: usize,
}

/// Multi-hop pass-through chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayeringConfig {
    /// Minimum number of hops for a qualifying chain
    pub min_hops: usize,
    /// Maximum chain length explored by the search
    pub max_depth: usize,
    /// Maximum delay between consecutive hops, in hours
    pub max_hop_latency_hours: i64,
    /// Lowest fraction of the incoming amount a hop may forward
    pub min_retention: Decimal,
    /// Highest fraction of the incoming amount a hop may forward
    pub max_retention: Decimal,
    /// Maximum number of search expansions per run
    pub scan_budget: u64,
    /// Optional wall-clock deadline per run, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_deadline_ms: Option<u64>,
}

/// Single-transaction reporting heuristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LargeValueConfig {
    pub reporting_threshold: Money,
}

/// Legitimacy scoring and damping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    /// Matches with legitimacy strictly above this are demoted
    pub legitimacy_threshold: Score,
    /// Multiplier applied to the confidence of demoted matches
    pub damping_factor: Decimal,
    /// Source systems that count as declared business channels
    pub business_channels: Vec<String>,
    pub weights: LegitimacyWeights,
}

/// Relative weight of each legitimacy signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegitimacyWeights {
    pub consistent_identity: Decimal,
    pub invoice_reference: Decimal,
    pub stable_origin: Decimal,
    pub business_channel: Decimal,
}

/// Case merging and escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Combined score at or above which a case escalates
    pub escalation_threshold: Score,
    pub kind_weights: KindWeights,
}

/// Per pattern kind weights used by the weighted maximum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindWeights {
    pub structuring: Decimal,
    pub layering: Decimal,
    pub large_value: Decimal,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            version: CONFIG_VERSION,
            structuring: StructuringConfig::default(),
            layering: LayeringConfig::default(),
            large_value: LargeValueConfig::default(),
            suppression: SuppressionConfig::default(),
            aggregation: AggregationConfig::default(),
        }
    }
}

impl Default for StructuringConfig {
    fn default() -> Self {
        StructuringConfig {
            window_hours: 48,
            threshold: dec!(10_000),
            low_fraction: dec!(0.90),
            min_multiplier: dec!(3),
            min_count: 3,
        }
    }
}

impl Default for LayeringConfig {
    fn default() -> Self {
        LayeringConfig {
            min_hops: 3,
            max_depth: 6,
            max_hop_latency_hours: 48,
            min_retention: dec!(0.40),
            max_retention: dec!(1.00),
            scan_budget: 200_000,
            scan_deadline_ms: None,
        }
    }
}

impl Default for LargeValueConfig {
    fn default() -> Self {
        LargeValueConfig {
            reporting_threshold: dec!(25_000),
        }
    }
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        SuppressionConfig {
            legitimacy_threshold: dec!(0.60),
            damping_factor: dec!(0.40),
            business_channels: vec![
                "business_banking_portal".to_string(),
                "business_banking_api".to_string(),
            ],
            weights: LegitimacyWeights::default(),
        }
    }
}

impl Default for LegitimacyWeights {
    fn default() -> Self {
        LegitimacyWeights {
            consistent_identity: dec!(0.25),
            invoice_reference: dec!(0.30),
            stable_origin: dec!(0.20),
            business_channel: dec!(0.25),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            escalation_threshold: dec!(0.70),
            kind_weights: KindWeights::default(),
        }
    }
}

impl Default for KindWeights {
    fn default() -> Self {
        KindWeights {
            structuring: dec!(1.0),
            layering: dec!(1.0),
            large_value: dec!(0.6),
        }
    }
}

fn require_unit_interval(field: &str, value: Decimal) -> AmlResult<()> {
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(AmlError::configuration(field, "Must be between 0 and 1"));
    }
    Ok(())
}

impl MonitorConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> AmlResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(AmlError::configuration(
                "version",
                format!(
                    "Unsupported configuration version {} (expected {})",
                    self.version, CONFIG_VERSION
                ),
            ));
        }

        let s = &self.structuring;
        if s.window_hours <= 0 || s.window_hours > MAX_WINDOW_HOURS {
            return Err(AmlError::configuration(
                "structuring.window_hours",
                format!("Must be between 1 and {MAX_WINDOW_HOURS}"),
            ));
        }
        if s.threshold <= Decimal::ZERO {
            return Err(AmlError::configuration(
                "structuring.threshold",
                "Must be positive",
            ));
        }
        if s.low_fraction <= Decimal::ZERO || s.low_fraction >= Decimal::ONE {
            return Err(AmlError::configuration(
                "structuring.low_fraction",
                "Must be strictly between 0 and 1",
            ));
        }
        if s.min_multiplier <= Decimal::ZERO {
            return Err(AmlError::configuration(
                "structuring.min_multiplier",
                "Must be positive",
            ));
        }
        if s.min_count == 0 {
            return Err(AmlError::configuration(
                "structuring.min_count",
                "Must be at least 1",
            ));
        }

        let l = &self.layering;
        if l.min_hops < 2 {
            return Err(AmlError::configuration(
                "layering.min_hops",
                "A chain needs at least 2 hops",
            ));
        }
        if l.max_depth < l.min_hops {
            return Err(AmlError::configuration(
                "layering.max_depth",
                "Must be greater than or equal to min_hops",
            ));
        }
        if l.max_hop_latency_hours <= 0 || l.max_hop_latency_hours > MAX_WINDOW_HOURS {
            return Err(AmlError::configuration(
                "layering.max_hop_latency_hours",
                format!("Must be between 1 and {MAX_WINDOW_HOURS}"),
            ));
        }
        if l.min_retention <= Decimal::ZERO
            || l.min_retention > l.max_retention
            || l.max_retention > Decimal::ONE
        {
            return Err(AmlError::configuration(
                "layering.min_retention",
                "Retention bounds must satisfy 0 < min <= max <= 1",
            ));
        }
        if l.scan_budget == 0 {
            return Err(AmlError::configuration(
                "layering.scan_budget",
                "Must be positive",
            ));
        }

        if self.large_value.reporting_threshold <= Decimal::ZERO {
            return Err(AmlError::configuration(
                "large_value.reporting_threshold",
                "Must be positive",
            ));
        }

        let sup = &self.suppression;
        require_unit_interval("suppression.legitimacy_threshold", sup.legitimacy_threshold)?;
        if sup.damping_factor <= Decimal::ZERO || sup.damping_factor > Decimal::ONE {
            return Err(AmlError::configuration(
                "suppression.damping_factor",
                "Must be in (0, 1]",
            ));
        }
        let w = &sup.weights;
        let weights = [
            w.consistent_identity,
            w.invoice_reference,
            w.stable_origin,
            w.business_channel,
        ];
        if weights.iter().any(|v| *v < Decimal::ZERO) {
            return Err(AmlError::configuration(
                "suppression.weights",
                "Weights must be non-negative",
            ));
        }
        if weights.iter().copied().sum::<Decimal>().is_zero() {
            return Err(AmlError::configuration(
                "suppression.weights",
                "At least one weight must be positive",
            ));
        }

        let agg = &self.aggregation;
        require_unit_interval("aggregation.escalation_threshold", agg.escalation_threshold)?;
        let k = &agg.kind_weights;
        if [k.structuring, k.layering, k.large_value]
            .iter()
            .any(|v| *v < Decimal::ZERO)
        {
            return Err(AmlError::configuration(
                "aggregation.kind_weights",
                "Weights must be non-negative",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.structuring.threshold, dec!(10000));
        assert_eq!(config.structuring.window_hours, 48);
        assert_eq!(config.layering.max_depth, 6);
        assert_eq!(config.layering.min_retention, dec!(0.4));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"structuring": {"min_count": 5}}"#).unwrap();
        assert_eq!(config.structuring.min_count, 5);
        assert_eq!(config.structuring.window_hours, 48);
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let config = MonitorConfig {
            version: 7,
            ..MonitorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AmlError::ConfigurationError { ref field, .. }) if field == "version"
        ));
    }

    #[test]
    fn test_low_fraction_bounds() {
        let mut config = MonitorConfig::default();
        config.structuring.low_fraction = dec!(1.0);
        assert!(config.validate().is_err());
        config.structuring.low_fraction = dec!(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_bounds() {
        let mut config = MonitorConfig::default();
        config.layering.min_retention = dec!(0.9);
        config.layering.max_retention = dec!(0.5);
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.layering.max_retention = dec!(1.2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_depth_must_cover_min_hops() {
        let mut config = MonitorConfig::default();
        config.layering.max_depth = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_windows_beyond_range_rejected() {
        let mut config = MonitorConfig::default();
        config.structuring.window_hours = i64::MAX / 2;
        assert!(matches!(
            config.validate(),
            Err(AmlError::ConfigurationError { ref field, .. }) if field == "structuring.window_hours"
        ));

        let mut config = MonitorConfig::default();
        config.layering.max_hop_latency_hours = MAX_WINDOW_HOURS + 1;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.structuring.window_hours = MAX_WINDOW_HOURS;
        config.layering.max_hop_latency_hours = MAX_WINDOW_HOURS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = MonitorConfig::default();
        config.layering.scan_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_escalation_threshold_range() {
        let mut config = MonitorConfig::default();
        config.aggregation.escalation_threshold = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_damping_range() {
        let mut config = MonitorConfig::default();
        config.suppression.damping_factor = dec!(0);
        assert!(config.validate().is_err());
        config.suppression.damping_factor = dec!(1);
        assert!(config.validate().is_ok());
    }
}
