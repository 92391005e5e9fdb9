//! Durable trade lifecycle records.
//!
//! A row is inserted when a position opens and updated, never re-inserted,
//! when it closes. Orphan flattens insert an already-closed row.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{PositionIntent, Side, VenueId};
use crate::error::{BastionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = BastionError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            other => Err(BastionError::Ledger(format!("unknown trade status '{other}'"))),
        }
    }
}

/// Why a trade row was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Strategy-issued exit
    Signal,
    /// Venue reported the position gone before our close
    ExternalClose,
    /// Unmanaged venue position flattened by reconciliation
    Orphan,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::ExternalClose => "external_close",
            ExitReason::Orphan => "orphan",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = BastionError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "signal" => Ok(ExitReason::Signal),
            "external_close" => Ok(ExitReason::ExternalClose),
            "orphan" => Ok(ExitReason::Orphan),
            other => Err(BastionError::Ledger(format!("unknown exit reason '{other}'"))),
        }
    }
}

/// Close-side fields of a trade row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeClose {
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub exit_reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTradeRow {
    pub symbol: String,
    pub venue: VenueId,
    pub strategy_id: String,
    pub side: Side,
    pub intent: PositionIntent,
    pub leverage: u32,
    pub entry_price: Decimal,
    /// Fee rate the entry fill paid: maker for resting limits, taker otherwise
    pub entry_fee_rate: Decimal,
    /// Venue-native quantity
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Present when the row is recorded already closed
    pub close: Option<TradeClose>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: i64,
    pub symbol: String,
    pub venue: VenueId,
    pub strategy_id: String,
    pub side: Side,
    pub intent: PositionIntent,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub entry_fee_rate: Decimal,
    pub quantity: Decimal,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeRow {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert_trade_row(&self, row: &NewTradeRow) -> Result<i64>;

    /// Close an open row. Fails if the row does not exist or is already closed.
    async fn update_trade_row(&self, id: i64, close: &TradeClose) -> Result<()>;

    /// Most recently opened open row for the symbol on the venue.
    async fn get_open_trade_row(
        &self,
        symbol: &str,
        venue: VenueId,
        strategy_id: Option<&str>,
    ) -> Result<Option<TradeRow>>;

    async fn get_all_open_trade_rows(&self) -> Result<Vec<TradeRow>>;
}
