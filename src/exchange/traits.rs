use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{OrderStatus, OrderType, Side, VenueId};
use crate::error::ExchangeError;

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Order as handed to a venue, quantity already in venue-native units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal, reduce_only: bool) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only,
        }
    }

    pub fn limit(
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity, reduce_only)
        }
    }
}

/// Venue view of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

impl OrderReport {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    /// Venue-native quantity, always positive
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub total: Decimal,
}

/// Per-asset balances keyed by asset code
pub type Balances = BTreeMap<String, AssetBalance>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentFill {
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
}

/// Contract every venue integration implements.
///
/// Spot adapters report holdings worth at least the venue's minimum
/// notional as long positions from `fetch_open_positions`.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> VenueId;

    fn is_paper(&self) -> bool {
        false
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderReport>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderReport>;

    async fn fetch_open_positions(&self) -> ExchangeResult<Vec<VenuePosition>>;

    async fn fetch_balance(&self) -> ExchangeResult<Balances>;

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    async fn fetch_recent_fills(&self, symbol: &str, limit: usize)
        -> ExchangeResult<Vec<RecentFill>>;

    async fn set_leverage(&self, leverage: u32, symbol: &str) -> ExchangeResult<()>;
}
