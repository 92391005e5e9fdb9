use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

use super::{Ledger, NewTradeRow, TradeClose, TradeRow, TradeStatus};
use crate::domain::VenueId;
use crate::error::{BastionError, Result};

/// Process-local ledger for dry runs and tests
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<Vec<TradeRow>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert and update fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<TradeRow> {
        self.rows.read().await.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BastionError::Ledger("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_trade_row(&self, row: &NewTradeRow) -> Result<i64> {
        self.check_writable()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let close = row.close.as_ref();
        let record = TradeRow {
            id,
            symbol: row.symbol.clone(),
            venue: row.venue,
            strategy_id: row.strategy_id.clone(),
            side: row.side,
            intent: row.intent,
            leverage: row.leverage,
            entry_price: row.entry_price,
            entry_fee_rate: row.entry_fee_rate,
            quantity: row.quantity,
            status: if close.is_some() {
                TradeStatus::Closed
            } else {
                TradeStatus::Open
            },
            opened_at: row.opened_at,
            exit_price: close.map(|c| c.exit_price),
            pnl: close.map(|c| c.pnl),
            pnl_pct: close.map(|c| c.pnl_pct),
            exit_reason: close.map(|c| c.exit_reason),
            closed_at: close.map(|c| c.closed_at),
        };
        self.rows.write().await.push(record);
        Ok(id)
    }

    async fn update_trade_row(&self, id: i64, close: &TradeClose) -> Result<()> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.is_open())
            .ok_or_else(|| BastionError::Ledger(format!("trade row {id} is not open")))?;

        row.status = TradeStatus::Closed;
        row.exit_price = Some(close.exit_price);
        row.pnl = Some(close.pnl);
        row.pnl_pct = Some(close.pnl_pct);
        row.exit_reason = Some(close.exit_reason);
        row.closed_at = Some(close.closed_at);
        Ok(())
    }

    async fn get_open_trade_row(
        &self,
        symbol: &str,
        venue: VenueId,
        strategy_id: Option<&str>,
    ) -> Result<Option<TradeRow>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.is_open() && r.symbol == symbol && r.venue == venue)
            .filter(|r| strategy_id.map_or(true, |s| r.strategy_id == s))
            .max_by_key(|r| (r.opened_at, r.id))
            .cloned())
    }

    async fn get_all_open_trade_rows(&self) -> Result<Vec<TradeRow>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|r| r.is_open()).cloned().collect())
    }
}
