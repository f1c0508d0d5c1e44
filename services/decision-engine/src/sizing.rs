//! Position sizing - margin budget to bounded contract size

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sizing configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingParams {
    /// Account leverage (e.g., 20 for 1:20)
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Fraction of balance committed as margin per trade
    #[serde(default = "default_risk_fraction")]
    pub risk_fraction: Decimal,
    /// Extra haircut on the margin budget (0.9 keeps 10% headroom)
    #[serde(default = "default_margin_protection")]
    pub margin_protection: Decimal,
    #[serde(default = "default_min_size")]
    pub min_size: Decimal,
    #[serde(default = "default_max_size")]
    pub max_size: Decimal,
    /// Size precision accepted by the broker; raw sizes are truncated to it
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
    /// Stop-loss distance in ATR multiples, if protective stops are wanted
    #[serde(default)]
    pub stop_loss_atr: Option<f64>,
    /// Take-profit distance in ATR multiples
    #[serde(default)]
    pub take_profit_atr: Option<f64>,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            risk_fraction: default_risk_fraction(),
            margin_protection: default_margin_protection(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            size_decimals: default_size_decimals(),
            stop_loss_atr: None,
            take_profit_atr: None,
        }
    }
}

fn default_leverage() -> Decimal { Decimal::from(20) }
fn default_risk_fraction() -> Decimal { dec("0.01") }
fn default_margin_protection() -> Decimal { dec("0.9") }
fn default_min_size() -> Decimal { dec("0.0001") }
fn default_max_size() -> Decimal { Decimal::from(10) }
fn default_size_decimals() -> u32 { 6 }

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

/// Which bound, if any, the raw size was clamped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clamp {
    None,
    ToMin,
    ToMax,
}

/// Sizing outcome
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sizing {
    pub size: Decimal,
    pub margin_required: Decimal,
    /// Margin the account is willing to commit (`marginToUse`)
    pub margin_budget: Decimal,
    pub clamp: Clamp,
}

impl Sizing {
    /// False when the min-size floor pushed margin above the budget
    pub fn is_affordable(&self) -> bool {
        self.margin_required <= self.margin_budget
    }
}

/// Size a position from a margin budget.
///
/// The raw size is truncated to `size_decimals` before clamping, so an
/// unclamped (or max-clamped) size never needs more margin than the budget.
/// Returns `None` for non-positive price/leverage/balance, inverted bounds,
/// or arithmetic overflow.
pub fn size_position(
    balance: Decimal,
    leverage: Decimal,
    price: Decimal,
    risk_fraction: Decimal,
    min_size: Decimal,
    max_size: Decimal,
    margin_protection: Decimal,
    size_decimals: u32,
) -> Option<Sizing> {
    if balance <= Decimal::ZERO
        || leverage <= Decimal::ZERO
        || price <= Decimal::ZERO
        || min_size > max_size
    {
        return None;
    }

    let margin_budget = balance
        .checked_mul(risk_fraction)?
        .checked_mul(margin_protection)?;
    let raw_size = margin_budget
        .checked_mul(leverage)?
        .checked_div(price)?
        .round_dp_with_strategy(size_decimals, RoundingStrategy::ToZero);

    let (size, clamp) = if raw_size < min_size {
        (min_size, Clamp::ToMin)
    } else if raw_size > max_size {
        (max_size, Clamp::ToMax)
    } else {
        (raw_size, Clamp::None)
    };

    let margin_required = size.checked_mul(price)?.checked_div(leverage)?;

    Some(Sizing {
        size,
        margin_required,
        margin_budget,
        clamp,
    })
}

/// Position sizer bound to configured parameters
#[derive(Debug, Clone)]
pub struct PositionSizer {
    params: SizingParams,
}

impl PositionSizer {
    pub fn new(params: SizingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SizingParams {
        &self.params
    }

    pub fn size(&self, balance: Decimal, price: Decimal) -> Option<Sizing> {
        size_position(
            balance,
            self.params.leverage,
            price,
            self.params.risk_fraction,
            self.params.min_size,
            self.params.max_size,
            self.params.margin_protection,
            self.params.size_decimals,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_unclamped_size() {
        // 10 * 0.01 * 0.9 = 0.09 margin; 0.09 * 20 / 2000 = 0.0009
        let sizing = size_position(
            d("10"), d("20"), d("2000"), d("0.01"), d("0.0001"), d("1"), d("0.9"), 6,
        )
        .unwrap();

        assert_eq!(sizing.clamp, Clamp::None);
        assert_eq!(sizing.size, d("0.0009"));
        assert_eq!(sizing.margin_budget, d("0.09"));
        assert_eq!(sizing.margin_required, d("0.09"));
        assert!(sizing.is_affordable());
    }

    #[test]
    fn test_clamped_to_min_is_unaffordable() {
        let sizing = size_position(
            d("10"), d("20"), d("2000"), d("0.01"), d("0.01"), d("1"), d("0.9"), 6,
        )
        .unwrap();

        assert_eq!(sizing.clamp, Clamp::ToMin);
        assert_eq!(sizing.size, d("0.01"));
        assert_eq!(sizing.margin_required, d("1"));
        assert!(!sizing.is_affordable());
    }

    #[test]
    fn test_clamped_to_max_stays_within_budget() {
        let sizing = size_position(
            d("100000"), d("20"), d("100"), d("0.1"), d("0.1"), d("5"), d("1"), 6,
        )
        .unwrap();

        assert_eq!(sizing.clamp, Clamp::ToMax);
        assert_eq!(sizing.size, d("5"));
        assert_eq!(sizing.margin_required, d("25"));
        assert!(sizing.is_affordable());
    }

    #[test]
    fn test_bounds_and_margin_identity_hold() {
        let balances = ["1", "10", "250.5", "10000", "999999"];
        let prices = ["0.5", "1.2345", "100", "2000", "65000"];
        let (min, max) = (d("0.001"), d("50"));

        for b in balances {
            for p in prices {
                let (balance, price, leverage) = (d(b), d(p), d("30"));
                let sizing = size_position(
                    balance, leverage, price, d("0.02"), min, max, d("0.9"), 6,
                )
                .unwrap();

                assert!(sizing.size >= min && sizing.size <= max);
                assert_eq!(sizing.margin_required, sizing.size * price / leverage);
                if sizing.clamp != Clamp::ToMin {
                    assert!(sizing.is_affordable());
                }
            }
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let ok = |b: &str, l: &str, p: &str| {
            size_position(d(b), d(l), d(p), d("0.01"), d("0.1"), d("1"), d("0.9"), 6).is_some()
        };
        assert!(!ok("0", "20", "100"));
        assert!(!ok("-5", "20", "100"));
        assert!(!ok("10", "0", "100"));
        assert!(!ok("10", "20", "0"));
        assert!(size_position(d("10"), d("20"), d("100"), d("0.01"), d("2"), d("1"), d("0.9"), 6)
            .is_none());
    }
}
