//! Contract sizes and lot steps per venue.
//!
//! Quantities handed to a venue are in its native unit: base-asset units on
//! spot and linear venues, whole contracts on contract-denominated venues.

use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::venue::{base_asset, is_option_symbol, VenueId};

/// Underlying units represented by one contract, when the venue trades contracts.
pub fn contract_size(venue: VenueId, symbol: &str) -> Option<Decimal> {
    match venue {
        VenueId::Binance | VenueId::Bybit => None,
        VenueId::Delta => {
            let base = base_asset(symbol);
            let size = match base.as_str() {
                "BTC" => dec!(0.001),
                "ETH" => dec!(0.01),
                "SOL" | "XRP" | "AVAX" => dec!(1),
                "DOGE" => dec!(100),
                _ if is_option_symbol(symbol) => dec!(0.001),
                _ => dec!(1),
            };
            Some(size)
        }
    }
}

/// Minimum quantity increment in the venue's native unit.
pub fn lot_step(venue: VenueId, symbol: &str) -> Decimal {
    let base = base_asset(symbol);
    match venue {
        VenueId::Binance => match base.as_str() {
            "BTC" => dec!(0.00001),
            "ETH" => dec!(0.0001),
            "SOL" | "BNB" => dec!(0.001),
            _ => dec!(0.01),
        },
        VenueId::Bybit => match base.as_str() {
            "BTC" => dec!(0.001),
            "ETH" => dec!(0.01),
            "SOL" => dec!(0.1),
            _ => dec!(1),
        },
        VenueId::Delta => Decimal::ONE,
    }
}

/// Convert a venue-native quantity into underlying units.
pub fn to_underlying(venue: VenueId, symbol: &str, native_qty: Decimal) -> Decimal {
    match contract_size(venue, symbol) {
        Some(size) => native_qty * size,
        None => native_qty,
    }
}

/// Convert underlying units into whole contracts, rounding to nearest with a floor of one.
///
/// Returns the quantity unchanged on venues that do not trade contracts.
pub fn to_contracts(venue: VenueId, symbol: &str, underlying_qty: Decimal) -> Decimal {
    match contract_size(venue, symbol) {
        Some(size) if !size.is_zero() => {
            let contracts = (underlying_qty / size)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
            contracts.max(Decimal::ONE)
        }
        _ => underlying_qty,
    }
}

/// Truncate a quantity down to a multiple of `step`.
pub fn truncate_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    ((qty / step).trunc() * step).normalize()
}

/// Round a quantity up to a multiple of `step`.
pub fn ceil_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    ((qty / step).ceil() * step).normalize()
}
