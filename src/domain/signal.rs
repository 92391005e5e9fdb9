use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::contracts;
use super::order::{OrderStyle, Side};
use super::venue::{InstrumentKind, VenueId};

/// What a position is meant to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionIntent {
    Spot,
    Long,
    Short,
}

impl PositionIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionIntent::Spot => "spot",
            PositionIntent::Long => "long",
            PositionIntent::Short => "short",
        }
    }

    /// Side of the order that opens this kind of position
    pub fn opening_side(&self) -> Side {
        match self {
            PositionIntent::Spot | PositionIntent::Long => Side::Buy,
            PositionIntent::Short => Side::Sell,
        }
    }

    pub fn closing_side(&self) -> Side {
        self.opening_side().opposite()
    }

    pub fn is_leveraged(&self) -> bool {
        !matches!(self, PositionIntent::Spot)
    }
}

impl std::fmt::Display for PositionIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PositionIntent {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(PositionIntent::Spot),
            "long" => Ok(PositionIntent::Long),
            "short" => Ok(PositionIntent::Short),
            other => Err(format!("unknown position intent: {other}")),
        }
    }
}

/// A trade request emitted by a strategy task.
///
/// Signals are never mutated after creation; use [`Signal::with_quantity`]
/// to derive a resized copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub side: Side,
    pub price: Decimal,
    /// Underlying units (contracts for option symbols)
    pub quantity: Decimal,
    pub order_style: OrderStyle,
    pub strategy_id: String,
    pub symbol: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: u32,
    pub intent: PositionIntent,
    pub reduce_only: bool,
    pub venue: VenueId,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Opening signal for the given intent; side follows from the intent.
    pub fn entry(
        strategy_id: impl Into<String>,
        venue: VenueId,
        symbol: impl Into<String>,
        intent: PositionIntent,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> Self {
        Self {
            side: intent.opening_side(),
            price,
            quantity,
            order_style: OrderStyle::Market,
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            stop_loss: None,
            take_profit: None,
            leverage: leverage.max(1),
            intent,
            reduce_only: false,
            venue,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Closing signal for an existing position.
    ///
    /// Spot exits are plain sells; leveraged exits are reduce-only.
    pub fn exit(position: &super::Position, price: Decimal) -> Self {
        Self {
            side: position.intent.closing_side(),
            price,
            quantity: position.quantity,
            order_style: OrderStyle::Market,
            strategy_id: position.strategy_id.clone(),
            symbol: position.symbol.clone(),
            stop_loss: None,
            take_profit: None,
            leverage: position.leverage,
            intent: position.intent,
            reduce_only: position.intent.is_leveraged(),
            venue: position.venue,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_style(self, order_style: OrderStyle) -> Self {
        Self { order_style, ..self }
    }

    pub fn with_stops(self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        Self {
            stop_loss,
            take_profit,
            ..self
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// New signal identical to this one except for quantity.
    pub fn with_quantity(&self, quantity: Decimal) -> Self {
        Self {
            quantity,
            ..self.clone()
        }
    }

    /// Reduce-only orders and spot sells close exposure.
    pub fn is_exit(&self) -> bool {
        self.reduce_only || (self.intent == PositionIntent::Spot && self.side == Side::Sell)
    }

    pub fn instrument_kind(&self) -> InstrumentKind {
        self.venue.instrument_kind(&self.symbol, self.intent)
    }

    /// Requested size in underlying units.
    pub fn underlying_quantity(&self) -> Decimal {
        if self.instrument_kind().is_contract_denominated() {
            contracts::to_underlying(self.venue, &self.symbol, self.quantity)
        } else {
            self.quantity
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.underlying_quantity()
    }

    /// Capital locked by this trade: notional / leverage.
    pub fn collateral(&self) -> Decimal {
        self.notional() / Decimal::from(self.leverage.max(1))
    }
}
