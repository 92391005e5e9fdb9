use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::contracts;
use super::order::Side;
use super::signal::{PositionIntent, Signal};
use super::venue::VenueId;

/// Open exposure as the risk manager believes it to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub venue: VenueId,
    pub side: Side,
    pub entry_price: Decimal,
    /// Venue-native quantity (contracts on contract venues)
    pub quantity: Decimal,
    pub strategy_id: String,
    pub leverage: u32,
    pub intent: PositionIntent,
    /// Entry notional in underlying units divided by leverage
    pub collateral: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        venue: VenueId,
        intent: PositionIntent,
        entry_price: Decimal,
        quantity: Decimal,
        leverage: u32,
        strategy_id: impl Into<String>,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let symbol = symbol.into();
        let leverage = leverage.max(1);
        let underlying = contracts::to_underlying(venue, &symbol, quantity);
        let collateral = entry_price * underlying / Decimal::from(leverage);
        Self {
            symbol,
            venue,
            side: intent.opening_side(),
            entry_price,
            quantity,
            strategy_id: strategy_id.into(),
            leverage,
            intent,
            collateral,
            opened_at,
        }
    }

    /// Position created by a confirmed fill of an opening signal.
    pub fn from_fill(
        signal: &Signal,
        entry_price: Decimal,
        quantity: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            signal.symbol.clone(),
            signal.venue,
            signal.intent,
            entry_price,
            quantity,
            signal.leverage,
            signal.strategy_id.clone(),
            opened_at,
        )
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * contracts::to_underlying(self.venue, &self.symbol, self.quantity)
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}
