//! Realized P&L for a closed position.
//!
//! Every close path (strategy exit, external close, orphan flatten) goes
//! through [`calc_pnl`] so one close event always produces one number.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::contracts;
use super::signal::PositionIntent;
use super::venue::VenueId;

/// Inputs for one realized P&L computation
#[derive(Debug, Clone)]
pub struct PnlInput<'a> {
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Venue-native quantity
    pub quantity: Decimal,
    pub intent: PositionIntent,
    pub leverage: u32,
    pub venue: VenueId,
    pub symbol: &'a str,
    pub entry_fee_rate: Decimal,
    pub exit_fee_rate: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnLResult {
    /// Net P&L in quote currency after fees
    pub net_pnl: Decimal,
    /// Net P&L as a percentage of collateral
    pub pnl_pct: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub collateral: Decimal,
}

impl PnLResult {
    pub fn zero() -> Self {
        Self {
            net_pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
            gross_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            collateral: Decimal::ZERO,
        }
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }
}

/// Fee-aware realized P&L, with the percentage taken against collateral.
pub fn calc_pnl(input: &PnlInput<'_>) -> PnLResult {
    let qty = contracts::to_underlying(input.venue, input.symbol, input.quantity);

    let gross_pnl = match input.intent {
        PositionIntent::Spot | PositionIntent::Long => (input.exit_price - input.entry_price) * qty,
        PositionIntent::Short => (input.entry_price - input.exit_price) * qty,
    };

    let entry_notional = input.entry_price * qty;
    let exit_notional = input.exit_price * qty;
    let fees = entry_notional * input.entry_fee_rate + exit_notional * input.exit_fee_rate;
    let net_pnl = gross_pnl - fees;

    let collateral = entry_notional / Decimal::from(input.leverage.max(1));
    let pnl_pct = if collateral.is_zero() {
        Decimal::ZERO
    } else {
        net_pnl / collateral * Decimal::ONE_HUNDRED
    };

    PnLResult {
        net_pnl,
        pnl_pct,
        gross_pnl,
        fees,
        collateral,
    }
}
