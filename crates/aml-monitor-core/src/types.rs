use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// All monetary values. Wraps Decimal to prevent accidental f64 usage.
pub type Money = Decimal;

/// Confidence and risk scores, always within [0, 1].
pub type Score = Decimal;

/// Currency code
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    GBP,
    #[default]
    USD,
    EUR,
    CHF,
    JPY,
    CAD,
    AUD,
    HKD,
    SGD,
    Other(String),
}

impl Currency {
    /// Map an ISO 4217 code onto the enum; unknown codes are kept verbatim.
    pub fn from_code(code: &str) -> Currency {
        match code.trim().to_uppercase().as_str() {
            "" | "USD" => Currency::USD,
            "GBP" => Currency::GBP,
            "EUR" => Currency::EUR,
            "CHF" => Currency::CHF,
            "JPY" => Currency::JPY,
            "CAD" => Currency::CAD,
            "AUD" => Currency::AUD,
            "HKD" => Currency::HKD,
            "SGD" => Currency::SGD,
            other => Currency::Other(other.to_string()),
        }
    }

    fn symbol(&self) -> Option<&'static str> {
        match self {
            Currency::USD | Currency::CAD | Currency::AUD | Currency::HKD | Currency::SGD => {
                Some("$")
            }
            Currency::GBP => Some("£"),
            Currency::EUR => Some("€"),
            Currency::JPY => Some("¥"),
            Currency::CHF | Currency::Other(_) => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Other(code) => write!(f, "{code}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Clamp a score into [0, 1].
pub fn clamp_score(score: Score) -> Score {
    score.max(Decimal::ZERO).min(Decimal::ONE)
}

/// Render an amount for evidence text: `$39,500`, `$44,812.50`, `CHF 1,200`.
pub fn format_amount(amount: Money, currency: &Currency) -> String {
    let rounded = amount.round_dp(2);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let abs = rounded.abs();
    let whole = abs.trunc();
    let cents = ((abs - whole) * Decimal::ONE_HUNDRED).trunc();

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if !cents.is_zero() {
        grouped.push_str(&format!(".{:02}", cents));
    }

    let sign = if negative { "-" } else { "" };
    match currency.symbol() {
        Some(symbol) => format!("{sign}{symbol}{grouped}"),
        None => format!("{sign}{currency} {grouped}"),
    }
}

/// Standard engine output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: EngineMetadata,
}

/// Metadata for every engine run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMetadata {
    pub version: String,
    pub schema_version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap run results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> EngineOutput<T> {
    EngineOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: EngineMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: crate::schema::SCHEMA_VERSION.to_string(),
            computation_time_us: elapsed_us,
            precision: "rust_decimal_128bit".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_format_whole_dollars() {
        assert_eq!(format_amount(dec!(39500), &Currency::USD), "$39,500");
        assert_eq!(format_amount(dec!(950), &Currency::USD), "$950");
        assert_eq!(format_amount(dec!(1250000.00), &Currency::USD), "$1,250,000");
    }

    #[test]
    fn test_format_cents_and_codes() {
        assert_eq!(format_amount(dec!(44812.5), &Currency::USD), "$44,812.50");
        assert_eq!(format_amount(dec!(1200), &Currency::CHF), "CHF 1,200");
        assert_eq!(
            format_amount(dec!(10), &Currency::Other("AED".into())),
            "AED 10"
        );
    }

    #[test]
    fn test_currency_from_code() {
        assert_eq!(Currency::from_code("usd"), Currency::USD);
        assert_eq!(Currency::from_code(""), Currency::USD);
        assert_eq!(Currency::from_code("aed"), Currency::Other("AED".into()));
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(dec!(1.4)), Decimal::ONE);
        assert_eq!(clamp_score(dec!(-0.2)), Decimal::ZERO);
        assert_eq!(clamp_score(dec!(0.42)), dec!(0.42));
    }
}
