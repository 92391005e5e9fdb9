//! Limit-then-market exit for leveraged positions.
//!
//! A reduce-only limit rests at the last price for a short window. If it has
//! not filled by then the live position is re-read before anything is
//! cancelled: the order may have filled after the status check, and a market
//! order sent on top of that would be rejected or, worse, flip the position.

use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::Side;
use crate::exchange::{ExchangeAdapter, OrderRequest};

/// States of one maker exit attempt. Every path ends in `Done` or `Fallback`
/// after at most one wait.
#[derive(Debug, Clone, PartialEq)]
pub enum MakerExit {
    Resting {
        order_id: String,
        price: Decimal,
    },
    Verifying {
        order_id: String,
        price: Decimal,
        filled: Decimal,
    },
    /// Limit filled in full
    Done {
        order_id: String,
        price: Decimal,
        quantity: Decimal,
    },
    /// Close what is left with a market order
    Fallback {
        maker_filled: Decimal,
        maker_price: Decimal,
        remaining: Decimal,
    },
}

impl MakerExit {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MakerExit::Done { .. } | MakerExit::Fallback { .. })
    }
}

fn full_fallback(quantity: Decimal) -> MakerExit {
    MakerExit::Fallback {
        maker_filled: Decimal::ZERO,
        maker_price: Decimal::ZERO,
        remaining: quantity,
    }
}

/// Drive a maker exit to a terminal state.
pub async fn run_maker_exit(
    adapter: &dyn ExchangeAdapter,
    symbol: &str,
    side: Side,
    quantity: Decimal,
    wait: Duration,
) -> MakerExit {
    let price = match adapter.fetch_ticker(symbol).await {
        Ok(ticker) if ticker.last > Decimal::ZERO => ticker.last,
        Ok(_) => return full_fallback(quantity),
        Err(e) => {
            debug!("No ticker for maker exit on {}: {}", symbol, e);
            return full_fallback(quantity);
        }
    };

    let request = OrderRequest::limit(symbol, side, quantity, price, true);
    let mut state = match adapter.place_order(&request).await {
        Ok(report) if report.is_filled() => MakerExit::Done {
            order_id: report.order_id,
            price: report.avg_price.unwrap_or(price),
            quantity: report.filled_qty,
        },
        Ok(report) => MakerExit::Resting {
            order_id: report.order_id,
            price,
        },
        Err(e) => {
            warn!("Maker exit order for {} refused: {}", symbol, e);
            return full_fallback(quantity);
        }
    };

    while !state.is_terminal() {
        state = match state {
            MakerExit::Resting { order_id, price } => {
                sleep(wait).await;
                match adapter.fetch_order(&order_id, symbol).await {
                    Ok(report) if report.is_filled() => MakerExit::Done {
                        order_id,
                        price: report.avg_price.unwrap_or(price),
                        quantity: report.filled_qty,
                    },
                    Ok(report) => MakerExit::Verifying {
                        order_id,
                        price,
                        filled: report.filled_qty,
                    },
                    Err(e) => {
                        debug!("Maker exit status check failed for {}: {}", order_id, e);
                        MakerExit::Verifying {
                            order_id,
                            price,
                            filled: Decimal::ZERO,
                        }
                    }
                }
            }
            MakerExit::Verifying {
                order_id,
                price,
                filled,
            } => verify(adapter, symbol, quantity, order_id, price, filled).await,
            terminal => terminal,
        };
    }

    state
}

async fn verify(
    adapter: &dyn ExchangeAdapter,
    symbol: &str,
    quantity: Decimal,
    order_id: String,
    price: Decimal,
    filled: Decimal,
) -> MakerExit {
    let live = match adapter.fetch_open_positions().await {
        Ok(positions) => positions.into_iter().find(|p| p.symbol == symbol),
        Err(e) => {
            warn!("Position check before cancelling {} failed: {}", order_id, e);
            cancel_quietly(adapter, symbol, &order_id).await;
            return MakerExit::Fallback {
                maker_filled: filled,
                maker_price: price,
                remaining: quantity - filled,
            };
        }
    };

    let Some(position) = live else {
        info!("Maker exit {} filled after status check", order_id);
        return MakerExit::Done {
            order_id,
            price,
            quantity,
        };
    };

    if let Err(e) = adapter.cancel_order(&order_id, symbol).await {
        // cancel refused: look again, it may have just filled
        debug!("Cancel of {} refused: {}", order_id, e);
        if let Ok(report) = adapter.fetch_order(&order_id, symbol).await {
            if report.is_filled() {
                return MakerExit::Done {
                    order_id,
                    price: report.avg_price.unwrap_or(price),
                    quantity: report.filled_qty,
                };
            }
        }
    }

    let remaining = position.quantity.min(quantity);
    MakerExit::Fallback {
        maker_filled: (quantity - remaining).max(Decimal::ZERO),
        maker_price: price,
        remaining,
    }
}

async fn cancel_quietly(adapter: &dyn ExchangeAdapter, symbol: &str, order_id: &str) {
    if let Err(e) = adapter.cancel_order(order_id, symbol).await {
        debug!("Cancel of {} failed: {}", order_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VenueId;
    use crate::exchange::{LimitFillMode, PaperExchange};
    use rust_decimal_macros::dec;

    async fn bybit_long() -> PaperExchange {
        let paper = PaperExchange::funded(VenueId::Bybit, dec!(10000)).await;
        paper.set_ticker("ETHUSDT", dec!(2000)).await;
        paper
            .seed_position("ETHUSDT", Side::Buy, dec!(1), dec!(1900))
            .await;
        paper
    }

    #[tokio::test]
    async fn test_immediate_fill_is_done() {
        let paper = bybit_long().await;
        let state = run_maker_exit(&paper, "ETHUSDT", Side::Sell, dec!(1), Duration::ZERO).await;
        assert!(matches!(state, MakerExit::Done { quantity, .. } if quantity == dec!(1)));
        assert!(paper.position("ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn test_resting_limit_falls_back() {
        let paper = bybit_long().await;
        paper.set_limit_fill_mode(LimitFillMode::Resting).await;

        let state = run_maker_exit(&paper, "ETHUSDT", Side::Sell, dec!(1), Duration::ZERO).await;
        assert_eq!(
            state,
            MakerExit::Fallback {
                maker_filled: dec!(0),
                maker_price: dec!(2000),
                remaining: dec!(1),
            }
        );
        // position untouched, limit cancelled
        assert!(paper.position("ETHUSDT").await.is_some());
    }

    #[tokio::test]
    async fn test_fill_between_check_and_cancel_is_done() {
        let paper = bybit_long().await;
        paper.set_limit_fill_mode(LimitFillMode::FillAfterCheck).await;

        let state = run_maker_exit(&paper, "ETHUSDT", Side::Sell, dec!(1), Duration::ZERO).await;
        assert!(matches!(state, MakerExit::Done { .. }));
        // exactly one order went out: no market order on top
        assert_eq!(paper.placed_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_ticker_skips_limit() {
        let paper = PaperExchange::funded(VenueId::Bybit, dec!(10000)).await;
        let state = run_maker_exit(&paper, "XRPUSDT", Side::Sell, dec!(10), Duration::ZERO).await;
        assert_eq!(state, full_fallback(dec!(10)));
        assert!(paper.placed_orders().await.is_empty());
    }
}
