//! In-process simulated venue.
//!
//! Keeps positions, balances, tickers, fills and resting orders in memory and
//! applies the owning venue's rules (lot step, minimum notional, whole
//! contracts, reduce-only). Used for dry runs and scenario tests; failures
//! can be injected per call type.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use super::traits::{
    AssetBalance, Balances, ExchangeAdapter, ExchangeResult, OrderReport, OrderRequest,
    RecentFill, Ticker, VenuePosition,
};
use crate::domain::contracts::{contract_size, lot_step, to_underlying};
use crate::domain::{base_asset, OrderStatus, OrderType, Side, VenueId, VenueSpec};
use crate::error::ExchangeError;

/// How resting limit orders behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitFillMode {
    /// Fill at the limit price as soon as placed
    #[default]
    Immediate,
    /// Rest until cancelled
    Resting,
    /// Report open on the next status check, then fill right after it
    FillAfterCheck,
}

#[derive(Debug, Default)]
struct PaperState {
    tickers: HashMap<String, Ticker>,
    positions: HashMap<String, VenuePosition>,
    spot_costs: HashMap<String, Decimal>,
    balances: Balances,
    fills: HashMap<String, Vec<RecentFill>>,
    orders: HashMap<String, (OrderRequest, OrderReport)>,
    leverage: HashMap<String, u32>,
    order_failures: VecDeque<ExchangeError>,
    position_failure: Option<ExchangeError>,
    balance_failure: Option<ExchangeError>,
    leverage_failure: Option<ExchangeError>,
    limit_fill_mode: LimitFillMode,
    hold_market_orders: bool,
    placed: Vec<OrderRequest>,
    next_id: u64,
}

pub struct PaperExchange {
    venue: VenueId,
    spec: VenueSpec,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(venue: VenueId) -> Self {
        Self::with_spec(venue, venue.spec())
    }

    pub fn with_spec(venue: VenueId, spec: VenueSpec) -> Self {
        Self {
            venue,
            spec,
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Paper venue holding `amount` of its quote asset.
    pub async fn funded(venue: VenueId, amount: Decimal) -> Self {
        let paper = Self::new(venue);
        let quote = paper.spec.quote_asset.to_string();
        paper.set_balance(&quote, amount).await;
        paper
    }

    pub async fn set_ticker(&self, symbol: &str, last: Decimal) {
        let mut state = self.state.lock().await;
        state.tickers.insert(
            symbol.to_string(),
            Ticker {
                last,
                bid: Some(last),
                ask: Some(last),
            },
        );
    }

    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        let mut state = self.state.lock().await;
        state.balances.insert(
            asset.to_string(),
            AssetBalance {
                free: amount,
                total: amount,
            },
        );
    }

    /// Place a position on the venue directly, as if opened elsewhere.
    pub async fn seed_position(&self, symbol: &str, side: Side, quantity: Decimal, entry: Decimal) {
        let mut state = self.state.lock().await;
        if self.spec.supports_spot {
            let asset = base_asset(symbol);
            credit(&mut state.balances, &asset, quantity);
            state.spot_costs.insert(asset, entry);
        } else {
            state.positions.insert(
                symbol.to_string(),
                VenuePosition {
                    symbol: symbol.to_string(),
                    side,
                    quantity,
                    entry_price: entry,
                },
            );
        }
    }

    /// Drop a position without a fill, as a liquidation or manual close would.
    pub async fn remove_position(&self, symbol: &str) {
        let mut state = self.state.lock().await;
        if self.spec.supports_spot {
            state.balances.remove(&base_asset(symbol));
        } else {
            state.positions.remove(symbol);
        }
    }

    pub async fn add_fill(&self, symbol: &str, fill: RecentFill) {
        let mut state = self.state.lock().await;
        state.fills.entry(symbol.to_string()).or_default().push(fill);
    }

    pub async fn push_order_failure(&self, err: ExchangeError) {
        self.state.lock().await.order_failures.push_back(err);
    }

    pub async fn fail_positions(&self, err: Option<ExchangeError>) {
        self.state.lock().await.position_failure = err;
    }

    pub async fn fail_balance(&self, err: Option<ExchangeError>) {
        self.state.lock().await.balance_failure = err;
    }

    pub async fn fail_leverage(&self, err: Option<ExchangeError>) {
        self.state.lock().await.leverage_failure = err;
    }

    pub async fn set_limit_fill_mode(&self, mode: LimitFillMode) {
        self.state.lock().await.limit_fill_mode = mode;
    }

    /// Market orders are acknowledged open and never fill.
    pub async fn hold_market_orders(&self, hold: bool) {
        self.state.lock().await.hold_market_orders = hold;
    }

    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.placed.clone()
    }

    pub async fn position(&self, symbol: &str) -> Option<VenuePosition> {
        self.state.lock().await.positions.get(symbol).cloned()
    }

    pub async fn balance(&self, asset: &str) -> Decimal {
        self.state
            .lock()
            .await
            .balances
            .get(asset)
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn leverage_for(&self, symbol: &str) -> Option<u32> {
        self.state.lock().await.leverage.get(symbol).copied()
    }

    fn validate_size(&self, request: &OrderRequest, price: Decimal) -> ExchangeResult<()> {
        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        if contract_size(self.venue, &request.symbol).is_some() && !request.quantity.fract().is_zero()
        {
            return Err(ExchangeError::InvalidOrder(format!(
                "{} contracts is not a whole number",
                request.quantity
            )));
        }
        let step = lot_step(self.venue, &request.symbol);
        if !(request.quantity % step).is_zero() {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity {} is not a multiple of lot step {}",
                request.quantity, step
            )));
        }
        if let Some(min) = self.spec.min_notional {
            let notional = to_underlying(self.venue, &request.symbol, request.quantity) * price;
            if request.side == Side::Buy && !request.reduce_only && notional < min {
                return Err(ExchangeError::InvalidOrder(format!(
                    "notional {} below minimum {}",
                    notional, min
                )));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        state: &mut PaperState,
        request: &OrderRequest,
        price: Decimal,
        fee_rate: Decimal,
    ) -> ExchangeResult<Decimal> {
        let filled = if self.spec.supports_spot {
            self.execute_spot(state, request, price, fee_rate)?
        } else {
            self.execute_derivative(state, request, price, fee_rate)?
        };

        state
            .fills
            .entry(request.symbol.clone())
            .or_default()
            .push(RecentFill {
                side: request.side,
                price,
                amount: filled,
                time: Utc::now(),
            });
        Ok(filled)
    }

    fn execute_spot(
        &self,
        state: &mut PaperState,
        request: &OrderRequest,
        price: Decimal,
        fee_rate: Decimal,
    ) -> ExchangeResult<Decimal> {
        let base = base_asset(&request.symbol);
        let quote = self.spec.quote_asset;
        let notional = price * request.quantity;

        match request.side {
            Side::Buy => {
                if free(&state.balances, quote) < notional {
                    return Err(ExchangeError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        notional,
                        quote,
                        free(&state.balances, quote)
                    )));
                }
                credit(&mut state.balances, quote, -notional);
                // fee is taken from the asset received
                credit(&mut state.balances, &base, request.quantity * (Decimal::ONE - fee_rate));
                state.spot_costs.insert(base, price);
            }
            Side::Sell => {
                if free(&state.balances, &base) < request.quantity {
                    return Err(ExchangeError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        request.quantity,
                        base,
                        free(&state.balances, &base)
                    )));
                }
                credit(&mut state.balances, &base, -request.quantity);
                credit(&mut state.balances, quote, notional * (Decimal::ONE - fee_rate));
            }
        }
        Ok(request.quantity)
    }

    fn execute_derivative(
        &self,
        state: &mut PaperState,
        request: &OrderRequest,
        price: Decimal,
        fee_rate: Decimal,
    ) -> ExchangeResult<Decimal> {
        let quote = self.spec.quote_asset;
        let existing = state.positions.get(&request.symbol).cloned();

        let (reducing, qty) = match &existing {
            Some(pos) if pos.side != request.side => (true, request.quantity.min(pos.quantity)),
            _ if request.reduce_only => {
                return Err(ExchangeError::InvalidOrder(format!(
                    "reduce-only {} would open or increase {}",
                    request.side, request.symbol
                )));
            }
            _ => (false, request.quantity),
        };

        if !reducing {
            let leverage = state.leverage.get(&request.symbol).copied().unwrap_or(1).max(1);
            let margin = to_underlying(self.venue, &request.symbol, qty) * price
                / Decimal::from(leverage);
            let available = free(&state.balances, quote) - margin_in_use(self.venue, state);
            if available < margin {
                return Err(ExchangeError::InsufficientFunds(format!(
                    "margin {} exceeds available {}",
                    margin, available
                )));
            }
        }

        let underlying = to_underlying(self.venue, &request.symbol, qty);
        credit(&mut state.balances, quote, -(underlying * price * fee_rate));

        match existing {
            Some(mut pos) if reducing => {
                let direction = if pos.side == Side::Buy {
                    Decimal::ONE
                } else {
                    -Decimal::ONE
                };
                let realized = (price - pos.entry_price) * underlying * direction;
                credit(&mut state.balances, quote, realized);
                pos.quantity -= qty;
                if pos.quantity.is_zero() {
                    state.positions.remove(&request.symbol);
                } else {
                    state.positions.insert(request.symbol.clone(), pos);
                }
            }
            Some(mut pos) => {
                let total = pos.quantity + qty;
                pos.entry_price = (pos.entry_price * pos.quantity + price * qty) / total;
                pos.quantity = total;
                state.positions.insert(request.symbol.clone(), pos);
            }
            None => {
                state.positions.insert(
                    request.symbol.clone(),
                    VenuePosition {
                        symbol: request.symbol.clone(),
                        side: request.side,
                        quantity: qty,
                        entry_price: price,
                    },
                );
            }
        }

        Ok(qty)
    }

    fn next_order_id(&self, state: &mut PaperState) -> String {
        state.next_id += 1;
        format!("paper-{}-{}", self.venue, state.next_id)
    }
}

fn free(balances: &Balances, asset: &str) -> Decimal {
    balances.get(asset).map(|b| b.free).unwrap_or(Decimal::ZERO)
}

fn credit(balances: &mut Balances, asset: &str, amount: Decimal) {
    let entry = balances.entry(asset.to_string()).or_insert(AssetBalance {
        free: Decimal::ZERO,
        total: Decimal::ZERO,
    });
    entry.free += amount;
    entry.total += amount;
}

fn margin_in_use(venue: VenueId, state: &PaperState) -> Decimal {
    state
        .positions
        .values()
        .map(|p| {
            let leverage = state.leverage.get(&p.symbol).copied().unwrap_or(1).max(1);
            to_underlying(venue, &p.symbol, p.quantity) * p.entry_price / Decimal::from(leverage)
        })
        .sum()
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn venue(&self) -> VenueId {
        self.venue
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderReport> {
        let mut state = self.state.lock().await;
        state.placed.push(request.clone());

        if let Some(err) = state.order_failures.pop_front() {
            debug!(venue = %self.venue, symbol = %request.symbol, "paper order failure injected: {}", err);
            return Err(err);
        }

        let price = match (request.order_type, request.price) {
            (OrderType::Limit, Some(p)) => p,
            _ => state
                .tickers
                .get(&request.symbol)
                .map(|t| t.last)
                .or(request.price)
                .ok_or_else(|| {
                    ExchangeError::InvalidOrder(format!("no price for {}", request.symbol))
                })?,
        };
        self.validate_size(request, price)?;

        let order_id = self.next_order_id(&mut state);
        let mut report = OrderReport {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            status: OrderStatus::Open,
            requested_qty: request.quantity,
            filled_qty: Decimal::ZERO,
            avg_price: None,
        };

        let fill_now = match request.order_type {
            OrderType::Market if state.hold_market_orders => None,
            OrderType::Market => Some(self.spec.taker_fee),
            OrderType::Limit if state.limit_fill_mode == LimitFillMode::Immediate => {
                Some(self.spec.maker_fee)
            }
            OrderType::Limit => None,
        };

        if let Some(fee_rate) = fill_now {
            let filled = self.execute(&mut state, request, price, fee_rate)?;
            report.status = OrderStatus::Filled;
            report.filled_qty = filled;
            report.avg_price = Some(price);
        }

        state
            .orders
            .insert(order_id, (request.clone(), report.clone()));
        Ok(report)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        let (_, report) = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if report.status.is_terminal() {
            return Err(ExchangeError::InvalidOrder(format!(
                "order {} already {}",
                order_id, report.status
            )));
        }
        report.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<OrderReport> {
        let mut state = self.state.lock().await;
        let (request, report) = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;

        if state.limit_fill_mode == LimitFillMode::FillAfterCheck
            && report.status == OrderStatus::Open
        {
            let price = request.price.unwrap_or(Decimal::ZERO);
            let maker_fee = self.spec.maker_fee;
            let filled = self.execute(&mut state, &request, price, maker_fee)?;
            if let Some((_, stored)) = state.orders.get_mut(order_id) {
                stored.status = OrderStatus::Filled;
                stored.filled_qty = filled;
                stored.avg_price = Some(price);
            }
        }
        Ok(report)
    }

    async fn fetch_open_positions(&self) -> ExchangeResult<Vec<VenuePosition>> {
        let state = self.state.lock().await;
        if let Some(err) = &state.position_failure {
            return Err(err.clone());
        }

        if !self.spec.supports_spot {
            let mut positions: Vec<VenuePosition> = state.positions.values().cloned().collect();
            positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            return Ok(positions);
        }

        let quote = self.spec.quote_asset;
        let min = self.spec.min_notional.unwrap_or(Decimal::ZERO);
        let mut positions = Vec::new();
        for (asset, balance) in &state.balances {
            if asset == quote || balance.total <= Decimal::ZERO {
                continue;
            }
            let symbol = format!("{}/{}", asset, quote);
            let Some(last) = state.tickers.get(&symbol).map(|t| t.last) else {
                continue;
            };
            if balance.total * last < min {
                continue;
            }
            positions.push(VenuePosition {
                entry_price: state.spot_costs.get(asset).copied().unwrap_or(last),
                symbol,
                side: Side::Buy,
                quantity: balance.total,
            });
        }
        Ok(positions)
    }

    async fn fetch_balance(&self) -> ExchangeResult<Balances> {
        let state = self.state.lock().await;
        if let Some(err) = &state.balance_failure {
            return Err(err.clone());
        }
        let mut balances = state.balances.clone();
        if !self.spec.supports_spot {
            let margin = margin_in_use(self.venue, &state);
            if let Some(quote) = balances.get_mut(self.spec.quote_asset) {
                quote.free -= margin;
            }
        }
        Ok(balances)
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.state
            .lock()
            .await
            .tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Other(format!("no market data for {}", symbol)))
    }

    async fn fetch_recent_fills(
        &self,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<RecentFill>> {
        let state = self.state.lock().await;
        let mut fills = state.fills.get(symbol).cloned().unwrap_or_default();
        fills.sort_by(|a, b| b.time.cmp(&a.time));
        fills.truncate(limit);
        Ok(fills)
    }

    async fn set_leverage(&self, leverage: u32, symbol: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = &state.leverage_failure {
            return Err(err.clone());
        }
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}
