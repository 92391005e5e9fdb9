//! Venue identities and their static trading rules.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{BastionError, Result};

/// Venues the core can route to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueId {
    /// Spot market, quantities in base-asset units
    Binance,
    /// Linear perpetuals, quantities in underlying units
    Bybit,
    /// Contract-denominated perpetuals and options
    Delta,
}

impl VenueId {
    pub const ALL: [VenueId; 3] = [VenueId::Binance, VenueId::Bybit, VenueId::Delta];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Delta => "delta",
        }
    }

    pub fn spec(&self) -> VenueSpec {
        match self {
            Self::Binance => VenueSpec {
                maker_fee: dec!(0.001),
                taker_fee: dec!(0.001),
                min_notional: Some(dec!(5)),
                min_notional_margin: dec!(0.10),
                supports_spot: true,
                supports_derivatives: false,
                lists_options: false,
                quote_asset: "USDT",
            },
            Self::Bybit => VenueSpec {
                maker_fee: dec!(0.0002),
                taker_fee: dec!(0.00055),
                min_notional: None,
                min_notional_margin: Decimal::ZERO,
                supports_spot: false,
                supports_derivatives: true,
                lists_options: false,
                quote_asset: "USDT",
            },
            Self::Delta => VenueSpec {
                maker_fee: dec!(0.0002),
                taker_fee: dec!(0.0005),
                min_notional: None,
                min_notional_margin: Decimal::ZERO,
                supports_spot: false,
                supports_derivatives: true,
                lists_options: true,
                quote_asset: "USD",
            },
        }
    }

    /// Classify the instrument a signal on this venue refers to.
    pub fn instrument_kind(&self, symbol: &str, intent: super::PositionIntent) -> InstrumentKind {
        if self.spec().lists_options && is_option_symbol(symbol) {
            return InstrumentKind::Option;
        }
        match intent {
            super::PositionIntent::Spot => InstrumentKind::Spot,
            super::PositionIntent::Long | super::PositionIntent::Short => InstrumentKind::Perpetual,
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VenueId {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "delta" | "delta_exchange" => Ok(Self::Delta),
            _ => Err("invalid venue; expected binance|bybit|delta"),
        }
    }
}

pub fn parse_venue_id(raw: &str) -> Result<VenueId> {
    VenueId::from_str(raw).map_err(|e| BastionError::Validation(e.to_string()))
}

/// Static per-venue trading rules
#[derive(Debug, Clone, PartialEq)]
pub struct VenueSpec {
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    /// Smallest order notional the venue accepts, if it enforces one
    pub min_notional: Option<Decimal>,
    /// Extra fraction added when bumping an entry over `min_notional`
    pub min_notional_margin: Decimal,
    pub supports_spot: bool,
    pub supports_derivatives: bool,
    pub lists_options: bool,
    pub quote_asset: &'static str,
}

/// What kind of instrument an order targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Spot,
    Perpetual,
    Option,
}

impl InstrumentKind {
    /// Options are already quoted in contracts.
    pub fn is_contract_denominated(&self) -> bool {
        matches!(self, InstrumentKind::Option)
    }
}

/// Recognises `C-BTC-90000-310125` and `BTC-310125-90000-P` style option symbols.
pub fn is_option_symbol(symbol: &str) -> bool {
    let parts: Vec<&str> = symbol.split('-').collect();
    if parts.len() != 4 {
        return false;
    }
    let is_flag = |p: &str| p.eq_ignore_ascii_case("c") || p.eq_ignore_ascii_case("p");
    let numeric = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());

    (is_flag(parts[0]) && numeric(parts[2]) && numeric(parts[3]))
        || (is_flag(parts[3]) && numeric(parts[1]) && numeric(parts[2]))
}

/// Base asset of a symbol: `BTC/USDT` -> `BTC`, `ETHUSDT` -> `ETH`, `C-BTC-90000-310125` -> `BTC`.
pub fn base_asset(symbol: &str) -> String {
    if is_option_symbol(symbol) {
        let parts: Vec<&str> = symbol.split('-').collect();
        let underlying = if parts[0].len() == 1 { parts[1] } else { parts[0] };
        return underlying.to_ascii_uppercase();
    }
    if let Some((base, _)) = symbol.split_once('/') {
        return base.to_ascii_uppercase();
    }
    let upper = symbol.to_ascii_uppercase();
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    upper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionIntent;

    #[test]
    fn test_parse_venue() {
        assert_eq!(parse_venue_id("Bybit").unwrap(), VenueId::Bybit);
        assert_eq!(parse_venue_id(" delta ").unwrap(), VenueId::Delta);
        assert!(parse_venue_id("ftx").is_err());
    }

    #[test]
    fn test_option_symbols() {
        assert!(is_option_symbol("C-BTC-90000-310125"));
        assert!(is_option_symbol("BTC-310125-90000-P"));
        assert!(!is_option_symbol("BTCUSD"));
        assert!(!is_option_symbol("BTC/USDT"));
        assert!(!is_option_symbol("C-BTC-ABC-310125"));
    }

    #[test]
    fn test_instrument_kind_routing() {
        assert_eq!(
            VenueId::Delta.instrument_kind("C-BTC-90000-310125", PositionIntent::Long),
            InstrumentKind::Option
        );
        assert_eq!(
            VenueId::Delta.instrument_kind("BTCUSD", PositionIntent::Short),
            InstrumentKind::Perpetual
        );
        // Bybit is not treated as an options venue even for option-shaped names
        assert_eq!(
            VenueId::Bybit.instrument_kind("BTC-310125-90000-P", PositionIntent::Long),
            InstrumentKind::Perpetual
        );
        assert_eq!(
            VenueId::Binance.instrument_kind("BTC/USDT", PositionIntent::Spot),
            InstrumentKind::Spot
        );
    }

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset("BTC/USDT"), "BTC");
        assert_eq!(base_asset("ethusdt"), "ETH");
        assert_eq!(base_asset("SOLUSD"), "SOL");
        assert_eq!(base_asset("C-ETH-3000-310125"), "ETH");
        assert_eq!(base_asset("BTC-310125-90000-P"), "BTC");
    }
}
