use chrono::{DateTime, Utc};
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::maker_exit::{run_maker_exit, MakerExit};
use super::retry::{with_retry, AttemptFailure, RetryPolicy};
use crate::config::ExecutionConfig;
use crate::domain::contracts::{ceil_to_step, contract_size, lot_step, to_contracts, truncate_to_step};
use crate::domain::{
    base_asset, calc_pnl, InstrumentKind, OrderStyle, OrderType, PnLResult, PnlInput, Position,
    Side, Signal, VenueId, VenueSpec,
};
use crate::error::{BastionError, ExchangeError, ExecutionError, Result};
use crate::exchange::{ExchangeAdapter, OrderReport, OrderRequest, VenueRegistry};
use crate::ledger::{ExitReason, Ledger, NewTradeRow, TradeClose, TradeRow};
use crate::notify::Notifier;
use crate::risk::{RecordOpenOutcome, RiskHandle};

/// A confirmed fill and what it was booked as
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub order_id: String,
    pub venue: VenueId,
    pub symbol: String,
    pub side: Side,
    /// Venue-native quantity
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee_rate: Decimal,
    pub maker: bool,
    pub ledger_id: Option<i64>,
    /// Realized result, exits only
    pub pnl: Option<PnLResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(FillReport),
    /// Exit found nothing to close; carries the settlement if one was booked
    AlreadyClosed(Option<PnLResult>),
    NoFill(ExecutionError),
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, ExecutionOutcome::Filled(_))
    }

    pub fn fill(&self) -> Option<&FillReport> {
        match self {
            ExecutionOutcome::Filled(fill) => Some(fill),
            _ => None,
        }
    }
}

/// An order that closed exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee_rate: Decimal,
    pub maker: bool,
}

/// Venue-native entry size for a signal.
///
/// Raises sub-minimum notionals to the venue floor plus margin, converts to
/// whole contracts where the venue trades contracts, and truncates to the
/// lot step elsewhere.
pub fn size_entry(
    signal: &Signal,
    spec: &VenueSpec,
    kind: InstrumentKind,
) -> std::result::Result<Decimal, ExecutionError> {
    if signal.price <= Decimal::ZERO || signal.quantity <= Decimal::ZERO {
        return Err(ExecutionError::SizeTooSmall(format!(
            "{} x {} on {}",
            signal.quantity, signal.price, signal.symbol
        )));
    }

    if kind == InstrumentKind::Option {
        let contracts = signal.quantity.trunc();
        if contracts < Decimal::ONE {
            return Err(ExecutionError::SizeTooSmall(format!(
                "{} contracts of {}",
                signal.quantity, signal.symbol
            )));
        }
        return Ok(contracts);
    }

    let step = lot_step(signal.venue, &signal.symbol);
    let mut quantity = signal.quantity;

    if let Some(min) = spec.min_notional {
        if signal.price * quantity < min {
            let bumped = ceil_to_step(
                min * (Decimal::ONE + spec.min_notional_margin) / signal.price,
                step,
            );
            info!(
                "Raising {} entry from {} to {} to clear {} minimum notional",
                signal.symbol, quantity, bumped, min
            );
            quantity = bumped;
        }
    }

    if contract_size(signal.venue, &signal.symbol).is_some() {
        return Ok(to_contracts(signal.venue, &signal.symbol, quantity));
    }

    let quantity = truncate_to_step(quantity, step);
    if quantity <= Decimal::ZERO {
        return Err(ExecutionError::SizeTooSmall(format!(
            "{} below lot step {} on {}",
            signal.quantity, step, signal.symbol
        )));
    }
    Ok(quantity)
}

fn routing_problem(signal: &Signal, spec: &VenueSpec, kind: InstrumentKind) -> Option<String> {
    match kind {
        InstrumentKind::Spot if !spec.supports_spot => Some(format!(
            "spot order for {} routed to derivatives venue {}",
            signal.symbol, signal.venue
        )),
        InstrumentKind::Perpetual | InstrumentKind::Option if !spec.supports_derivatives => {
            Some(format!(
                "{} order for {} routed to spot venue {}",
                signal.intent, signal.symbol, signal.venue
            ))
        }
        _ if !signal.is_exit() && signal.side != signal.intent.opening_side() => Some(format!(
            "{} entry for {} must be a {}",
            signal.intent,
            signal.symbol,
            signal.intent.opening_side()
        )),
        _ => None,
    }
}

/// Turns approved signals into venue orders and books the result.
pub struct TradeExecutor {
    venues: Arc<VenueRegistry>,
    risk: RiskHandle,
    ledger: Arc<dyn Ledger>,
    notifier: Option<Arc<dyn Notifier>>,
    config: ExecutionConfig,
    shutdown: watch::Receiver<bool>,
    /// Positions whose failed exit has already been escalated
    alerted: DashSet<(VenueId, String)>,
}

impl TradeExecutor {
    pub fn new(
        venues: Arc<VenueRegistry>,
        risk: RiskHandle,
        ledger: Arc<dyn Ledger>,
        config: ExecutionConfig,
    ) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            venues,
            risk,
            ledger,
            notifier: None,
            config,
            shutdown,
            alerted: DashSet::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Entries stop retrying once this flips to `true`. Exits ignore it.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn venues(&self) -> &Arc<VenueRegistry> {
        &self.venues
    }

    pub fn risk(&self) -> &RiskHandle {
        &self.risk
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn notify(&self, message: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.send_text(message);
        }
    }

    /// Whether a failed exit for this position has been escalated and not yet resolved.
    pub fn is_alerted(&self, venue: VenueId, symbol: &str) -> bool {
        self.alerted.contains(&(venue, symbol.to_string()))
    }

    fn clear_alert(&self, venue: VenueId, symbol: &str) {
        self.alerted.remove(&(venue, symbol.to_string()));
    }

    /// Execute an approved signal.
    ///
    /// `Err` is reserved for faults outside the order path (risk task gone,
    /// unknown venue, unexpected venue error on entry); everything the venue
    /// can say about the order itself comes back as an [`ExecutionOutcome`].
    #[instrument(skip(self, signal), fields(venue = %signal.venue, symbol = %signal.symbol, strategy = %signal.strategy_id))]
    pub async fn execute(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let adapter = self.venues.adapter(signal.venue)?.clone();
        let spec = self.venues.spec(signal.venue);
        let kind = signal.instrument_kind();

        if let Some(problem) = routing_problem(signal, &spec, kind) {
            warn!("Refusing signal: {}", problem);
            return Ok(ExecutionOutcome::NoFill(ExecutionError::Invalid(problem)));
        }

        if signal.is_exit() {
            self.execute_exit(signal, adapter.as_ref(), &spec, kind).await
        } else {
            self.execute_entry(signal, adapter.as_ref(), &spec, kind).await
        }
    }

    async fn execute_entry(
        &self,
        signal: &Signal,
        adapter: &dyn ExchangeAdapter,
        spec: &VenueSpec,
        kind: InstrumentKind,
    ) -> Result<ExecutionOutcome> {
        let quantity = match size_entry(signal, spec, kind) {
            Ok(quantity) => quantity,
            Err(e) => {
                warn!("Entry not placed: {}", e);
                return Ok(ExecutionOutcome::NoFill(e));
            }
        };

        if kind == InstrumentKind::Perpetual && signal.leverage > 1 {
            if let Err(e) = adapter.set_leverage(signal.leverage, &signal.symbol).await {
                warn!(
                    "Failed to set {}x leverage on {}: {} (continuing)",
                    signal.leverage, signal.symbol, e
                );
            }
        }

        let request = match signal.order_style {
            OrderStyle::Market => OrderRequest::market(&signal.symbol, signal.side, quantity, false),
            OrderStyle::Limit => {
                OrderRequest::limit(&signal.symbol, signal.side, quantity, signal.price, false)
            }
        };

        let placed = with_retry(
            &self.config,
            RetryPolicy::Entry,
            &self.shutdown,
            "entry order",
            || adapter.place_order(&request),
        )
        .await;

        let report = match placed {
            Ok(report) if report.is_filled() => report,
            Ok(report) => self.await_entry_fill(adapter, report).await,
            Err(failure) => return self.entry_failed(signal, failure),
        };

        if report.filled_qty <= Decimal::ZERO {
            info!("Entry order {} ended {} without a fill", report.order_id, report.status);
            return Ok(ExecutionOutcome::NoFill(ExecutionError::Unfilled(format!(
                "order {} {}",
                report.order_id, report.status
            ))));
        }

        let maker = request.order_type == OrderType::Limit;
        let fee_rate = if maker { spec.maker_fee } else { spec.taker_fee };
        let price = fill_price(adapter, &report, signal.price).await;
        let opened_at = Utc::now();

        let row = NewTradeRow {
            symbol: signal.symbol.clone(),
            venue: signal.venue,
            strategy_id: signal.strategy_id.clone(),
            side: signal.side,
            intent: signal.intent,
            leverage: signal.leverage,
            entry_price: price,
            entry_fee_rate: fee_rate,
            quantity: report.filled_qty,
            opened_at,
            close: None,
        };
        let ledger_id = match self.ledger.insert_trade_row(&row).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to record entry for {}: {}", signal.symbol, e);
                None
            }
        };

        let position = Position::from_fill(signal, price, report.filled_qty, opened_at);
        if self.risk.record_open(position).await? == RecordOpenOutcome::Duplicate {
            warn!("Risk already tracks {}; fill not re-recorded", signal.symbol);
        }

        info!(
            "Entry filled: {} {} {} @ {} (order {})",
            signal.side, report.filled_qty, signal.symbol, price, report.order_id
        );

        Ok(ExecutionOutcome::Filled(FillReport {
            order_id: report.order_id,
            venue: signal.venue,
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity: report.filled_qty,
            price,
            fee_rate,
            maker,
            ledger_id,
            pnl: None,
        }))
    }

    /// Give a resting entry limit one wait, then cancel whatever is left.
    async fn await_entry_fill(&self, adapter: &dyn ExchangeAdapter, report: OrderReport) -> OrderReport {
        sleep(Duration::from_millis(self.config.maker_exit_wait_ms)).await;

        match adapter.fetch_order(&report.order_id, &report.symbol).await {
            Ok(latest) if latest.is_filled() => return latest,
            Ok(_) => {}
            Err(e) => debug!("Entry status check for {} failed: {}", report.order_id, e),
        }

        if let Err(e) = adapter.cancel_order(&report.order_id, &report.symbol).await {
            debug!("Cancel of entry {} refused: {}", report.order_id, e);
        }

        match adapter.fetch_order(&report.order_id, &report.symbol).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Final status of entry {} unknown: {}", report.order_id, e);
                report
            }
        }
    }

    fn entry_failed(&self, signal: &Signal, failure: AttemptFailure) -> Result<ExecutionOutcome> {
        match failure {
            AttemptFailure::Rejected(e) => {
                warn!("Entry rejected by {}: {}", signal.venue, e);
                self.notify(&format!(
                    "[bastion] entry rejected on {} {} ({}): {}",
                    signal.venue, signal.symbol, signal.strategy_id, e
                ));
                Ok(ExecutionOutcome::NoFill(ExecutionError::VenueRejected(e)))
            }
            AttemptFailure::Exhausted { attempts, last } => {
                error!("Entry failed after {} attempts: {}", attempts, last);
                self.notify(&format!(
                    "[bastion] entry failed on {} {} after {} attempts: {}",
                    signal.venue, signal.symbol, attempts, last
                ));
                Ok(ExecutionOutcome::NoFill(ExecutionError::TransientNetwork {
                    attempts,
                    last,
                }))
            }
            AttemptFailure::Cancelled => {
                info!("Entry for {} abandoned on shutdown", signal.symbol);
                Ok(ExecutionOutcome::NoFill(ExecutionError::Cancelled))
            }
            AttemptFailure::Fatal(e) | AttemptFailure::NoPosition(e) => {
                error!("Entry failed on {}: {}", signal.venue, e);
                self.notify(&format!(
                    "[bastion] entry error on {} {}: {}",
                    signal.venue, signal.symbol, e
                ));
                Err(BastionError::exchange(signal.venue, e))
            }
        }
    }

    async fn execute_exit(
        &self,
        signal: &Signal,
        adapter: &dyn ExchangeAdapter,
        spec: &VenueSpec,
        kind: InstrumentKind,
    ) -> Result<ExecutionOutcome> {
        let live = match kind {
            InstrumentKind::Spot => self.spot_holding(adapter, signal).await,
            InstrumentKind::Perpetual | InstrumentKind::Option => {
                self.derivative_holding(adapter, signal).await
            }
        };

        let (quantity, side) = match live {
            Ok(Some(holding)) => holding,
            Ok(None) | Err(AttemptFailure::NoPosition(_)) => return self.already_closed(signal).await,
            Err(failure) => return Ok(self.exit_failed(signal, failure)),
        };

        let fill = if kind == InstrumentKind::Perpetual && self.config.maker_exit_enabled {
            self.maker_then_market(adapter, spec, signal, quantity, side).await
        } else {
            let reduce_only = kind != InstrumentKind::Spot;
            self.market_exit(adapter, spec, signal, quantity, side, reduce_only)
                .await
        };

        match fill {
            Ok(fill) => self.settle_exit(signal, spec, fill).await,
            Err(AttemptFailure::NoPosition(_)) => self.already_closed(signal).await,
            Err(failure) => Ok(self.exit_failed(signal, failure)),
        }
    }

    /// Free balance of the base asset, cut to the lot step. Spot buys pay
    /// their fee in the asset, so this is usually below the entry quantity.
    async fn spot_holding(
        &self,
        adapter: &dyn ExchangeAdapter,
        signal: &Signal,
    ) -> std::result::Result<Option<(Decimal, Side)>, AttemptFailure> {
        let balances = with_retry(
            &self.config,
            RetryPolicy::Exit,
            &self.shutdown,
            "balance fetch",
            || adapter.fetch_balance(),
        )
        .await?;

        let asset = base_asset(&signal.symbol);
        let held = balances.get(&asset).map(|b| b.free).unwrap_or(Decimal::ZERO);
        let quantity = truncate_to_step(held, lot_step(signal.venue, &signal.symbol));
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }
        if quantity != signal.quantity {
            debug!(
                "Spot exit for {} sized to held {} (signal asked {})",
                signal.symbol, quantity, signal.quantity
            );
        }
        Ok(Some((quantity, Side::Sell)))
    }

    async fn derivative_holding(
        &self,
        adapter: &dyn ExchangeAdapter,
        signal: &Signal,
    ) -> std::result::Result<Option<(Decimal, Side)>, AttemptFailure> {
        let positions = with_retry(
            &self.config,
            RetryPolicy::Exit,
            &self.shutdown,
            "position fetch",
            || adapter.fetch_open_positions(),
        )
        .await?;

        Ok(positions
            .into_iter()
            .find(|p| p.symbol == signal.symbol && p.quantity > Decimal::ZERO)
            .map(|p| (p.quantity, p.side.opposite())))
    }

    async fn market_exit(
        &self,
        adapter: &dyn ExchangeAdapter,
        spec: &VenueSpec,
        signal: &Signal,
        quantity: Decimal,
        side: Side,
        reduce_only: bool,
    ) -> std::result::Result<ExitFill, AttemptFailure> {
        let request = OrderRequest::market(&signal.symbol, side, quantity, reduce_only);
        let report = with_retry(
            &self.config,
            RetryPolicy::Exit,
            &self.shutdown,
            "exit order",
            || adapter.place_order(&request),
        )
        .await?;

        let Some(report) = confirmed_fill(adapter, report).await else {
            return Err(AttemptFailure::Fatal(ExchangeError::Other(format!(
                "exit order for {} {} acknowledged without a fill",
                quantity, signal.symbol
            ))));
        };
        Ok(ExitFill {
            price: fill_price(adapter, &report, signal.price).await,
            order_id: report.order_id,
            quantity: report.filled_qty,
            fee_rate: spec.taker_fee,
            maker: false,
        })
    }

    async fn maker_then_market(
        &self,
        adapter: &dyn ExchangeAdapter,
        spec: &VenueSpec,
        signal: &Signal,
        quantity: Decimal,
        side: Side,
    ) -> std::result::Result<ExitFill, AttemptFailure> {
        let wait = Duration::from_millis(self.config.maker_exit_wait_ms);
        match run_maker_exit(adapter, &signal.symbol, side, quantity, wait).await {
            MakerExit::Done {
                order_id,
                price,
                quantity,
            } => Ok(ExitFill {
                order_id,
                price,
                quantity,
                fee_rate: spec.maker_fee,
                maker: true,
            }),
            MakerExit::Fallback {
                maker_filled,
                maker_price,
                remaining,
            } => {
                debug!(
                    "Maker exit for {} falling back to market for {}",
                    signal.symbol, remaining
                );
                let market = self
                    .market_exit(adapter, spec, signal, remaining, side, true)
                    .await?;
                if maker_filled <= Decimal::ZERO {
                    return Ok(market);
                }
                let total = maker_filled + market.quantity;
                Ok(ExitFill {
                    price: (maker_price * maker_filled + market.price * market.quantity) / total,
                    fee_rate: (spec.maker_fee * maker_filled + spec.taker_fee * market.quantity)
                        / total,
                    quantity: total,
                    order_id: market.order_id,
                    maker: false,
                })
            }
            // run_maker_exit only returns terminal states
            other => {
                warn!("Maker exit ended in {:?}; closing at market", other);
                self.market_exit(adapter, spec, signal, quantity, side, true)
                    .await
            }
        }
    }

    fn exit_failed(&self, signal: &Signal, failure: AttemptFailure) -> ExecutionOutcome {
        let (attempts, last) = match failure {
            AttemptFailure::Exhausted { attempts, last } => (attempts, last),
            AttemptFailure::Rejected(e) | AttemptFailure::Fatal(e) | AttemptFailure::NoPosition(e) => {
                (1, e)
            }
            AttemptFailure::Cancelled => (0, ExchangeError::Other("cancelled".to_string())),
        };

        error!(
            "Exit for {} on {} failed after {} attempts: {}; position remains open",
            signal.symbol, signal.venue, attempts, last
        );
        if self.alerted.insert((signal.venue, signal.symbol.clone())) {
            self.notify(&format!(
                "[bastion] EXIT FAILED on {} {} ({}) after {} attempts: {}. Position is still open.",
                signal.venue, signal.symbol, signal.strategy_id, attempts, last
            ));
        }
        ExecutionOutcome::NoFill(ExecutionError::ExitExhausted { attempts, last })
    }

    async fn already_closed(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let tracked = self
            .risk
            .position(&signal.symbol)
            .await?
            .filter(|p| p.venue == signal.venue);

        let Some(position) = tracked else {
            info!("{} already flat on {}; nothing tracked", signal.symbol, signal.venue);
            self.clear_alert(signal.venue, &signal.symbol);
            return Ok(ExecutionOutcome::AlreadyClosed(None));
        };

        info!(
            "{} already closed on {}; settling from venue history",
            signal.symbol, signal.venue
        );
        let pnl = self
            .settle_external_close(&position, ExitReason::ExternalClose)
            .await?;
        Ok(ExecutionOutcome::AlreadyClosed(Some(pnl)))
    }

    async fn settle_exit(
        &self,
        signal: &Signal,
        spec: &VenueSpec,
        fill: ExitFill,
    ) -> Result<ExecutionOutcome> {
        let closed_at = Utc::now();
        let row = self
            .open_row(&signal.symbol, signal.venue, &signal.strategy_id)
            .await;
        let tracked = self
            .risk
            .position(&signal.symbol)
            .await?
            .filter(|p| p.venue == signal.venue);

        let (entry_price, leverage, intent, entry_fee_rate) = match (&row, &tracked) {
            (Some(r), _) => (r.entry_price, r.leverage, r.intent, r.entry_fee_rate),
            (None, Some(p)) => (p.entry_price, p.leverage, p.intent, spec.taker_fee),
            (None, None) => {
                warn!(
                    "Exit for {} on {} filled after its close was booked elsewhere; not booking again",
                    signal.symbol, signal.venue
                );
                self.clear_alert(signal.venue, &signal.symbol);
                return Ok(ExecutionOutcome::Filled(FillReport {
                    order_id: fill.order_id,
                    venue: signal.venue,
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    quantity: fill.quantity,
                    price: fill.price,
                    fee_rate: fill.fee_rate,
                    maker: fill.maker,
                    ledger_id: None,
                    pnl: None,
                }));
            }
        };

        let pnl = calc_pnl(&PnlInput {
            entry_price,
            exit_price: fill.price,
            quantity: fill.quantity,
            intent,
            leverage,
            venue: signal.venue,
            symbol: &signal.symbol,
            entry_fee_rate,
            exit_fee_rate: fill.fee_rate,
        });

        if let Some(row) = &row {
            self.close_row(row.id, fill.price, &pnl, ExitReason::Signal, closed_at)
                .await;
        }
        self.risk.record_close(&signal.symbol, pnl.net_pnl).await?;
        self.clear_alert(signal.venue, &signal.symbol);

        info!(
            "Exit filled: {} {} @ {} net {} ({}%)",
            fill.quantity,
            signal.symbol,
            fill.price,
            pnl.net_pnl.round_dp(4),
            pnl.pnl_pct.round_dp(2)
        );

        Ok(ExecutionOutcome::Filled(FillReport {
            order_id: fill.order_id,
            venue: signal.venue,
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity: fill.quantity,
            price: fill.price,
            fee_rate: fill.fee_rate,
            maker: fill.maker,
            ledger_id: row.map(|r| r.id),
            pnl: Some(pnl),
        }))
    }

    /// Book a close the venue performed on its own (stop, liquidation,
    /// manual close). Shared by exits that find nothing to close and by
    /// reconciliation.
    pub async fn settle_external_close(
        &self,
        position: &Position,
        reason: ExitReason,
    ) -> Result<PnLResult> {
        let adapter = self.venues.adapter(position.venue)?.clone();
        let spec = self.venues.spec(position.venue);
        let exit_price = self.external_exit_price(adapter.as_ref(), position).await;
        let row = self
            .open_row(&position.symbol, position.venue, &position.strategy_id)
            .await;
        let (entry_price, entry_fee_rate) = row
            .as_ref()
            .map(|r| (r.entry_price, r.entry_fee_rate))
            .unwrap_or((position.entry_price, spec.taker_fee));

        let pnl = calc_pnl(&PnlInput {
            entry_price,
            exit_price,
            quantity: position.quantity,
            intent: position.intent,
            leverage: position.leverage,
            venue: position.venue,
            symbol: &position.symbol,
            entry_fee_rate,
            exit_fee_rate: spec.taker_fee,
        });

        if let Some(row) = &row {
            self.close_row(row.id, exit_price, &pnl, reason, Utc::now())
                .await;
        }
        self.risk.record_close(&position.symbol, pnl.net_pnl).await?;
        self.clear_alert(position.venue, &position.symbol);

        warn!(
            "Settled external close of {} on {} @ {}: net {}",
            position.symbol,
            position.venue,
            exit_price,
            pnl.net_pnl.round_dp(4)
        );
        Ok(pnl)
    }

    /// Most recent closing fill after the position opened, else last price,
    /// else the entry price.
    async fn external_exit_price(&self, adapter: &dyn ExchangeAdapter, position: &Position) -> Decimal {
        let closing_side = position.side.opposite();
        match adapter
            .fetch_recent_fills(&position.symbol, self.config.fill_lookback)
            .await
        {
            Ok(fills) => {
                if let Some(fill) = fills
                    .into_iter()
                    .filter(|f| f.side == closing_side && f.time >= position.opened_at)
                    .max_by_key(|f| f.time)
                {
                    return fill.price;
                }
            }
            Err(e) => debug!("Recent fills for {} unavailable: {}", position.symbol, e),
        }

        match adapter.fetch_ticker(&position.symbol).await {
            Ok(ticker) if ticker.last > Decimal::ZERO => ticker.last,
            _ => position.entry_price,
        }
    }

    /// Close exposure the core does not track. Spot sells the lot-step part
    /// of `quantity`; derivatives send a reduce-only market order.
    ///
    /// Returns `Ok(None)` when nothing tradeable is left after rounding.
    #[instrument(skip(self))]
    pub async fn flatten(
        &self,
        venue: VenueId,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<Option<ExitFill>> {
        let adapter = self.venues.adapter(venue)?.clone();
        let spec = self.venues.spec(venue);
        let reduce_only = !spec.supports_spot;
        let quantity = if reduce_only {
            quantity
        } else {
            truncate_to_step(quantity, lot_step(venue, symbol))
        };
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        let request = OrderRequest::market(symbol, side, quantity, reduce_only);
        let report = with_retry(
            &self.config,
            RetryPolicy::Exit,
            &self.shutdown,
            "flatten order",
            || adapter.place_order(&request),
        )
        .await
        .map_err(|failure| match failure {
            AttemptFailure::Exhausted { last, .. }
            | AttemptFailure::Rejected(last)
            | AttemptFailure::Fatal(last)
            | AttemptFailure::NoPosition(last) => BastionError::exchange(venue, last),
            AttemptFailure::Cancelled => {
                BastionError::Internal(format!("flatten of {} cancelled", symbol))
            }
        })?;

        let Some(report) = confirmed_fill(adapter.as_ref(), report).await else {
            return Err(BastionError::exchange(
                venue,
                ExchangeError::Other(format!(
                    "flatten order for {} {} acknowledged without a fill",
                    quantity, symbol
                )),
            ));
        };

        let price = match report.avg_price.filter(|p| *p > Decimal::ZERO) {
            Some(price) => price,
            None => adapter
                .fetch_ticker(symbol)
                .await
                .map(|t| t.last)
                .unwrap_or(Decimal::ZERO),
        };
        Ok(Some(ExitFill {
            order_id: report.order_id,
            price,
            quantity: report.filled_qty,
            fee_rate: spec.taker_fee,
            maker: false,
        }))
    }

    async fn open_row(&self, symbol: &str, venue: VenueId, strategy_id: &str) -> Option<TradeRow> {
        match self
            .ledger
            .get_open_trade_row(symbol, venue, Some(strategy_id))
            .await
        {
            Ok(Some(row)) => return Some(row),
            Ok(None) => {}
            Err(e) => {
                error!("Ledger lookup for {} failed: {}", symbol, e);
                return None;
            }
        }
        match self.ledger.get_open_trade_row(symbol, venue, None).await {
            Ok(row) => row,
            Err(e) => {
                error!("Ledger lookup for {} failed: {}", symbol, e);
                None
            }
        }
    }

    async fn close_row(
        &self,
        id: i64,
        exit_price: Decimal,
        pnl: &PnLResult,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) {
        let close = TradeClose {
            exit_price,
            pnl: pnl.net_pnl,
            pnl_pct: pnl.pnl_pct,
            exit_reason: reason,
            closed_at,
        };
        if let Err(e) = self.ledger.update_trade_row(id, &close).await {
            error!("Failed to close trade row {}: {}", id, e);
        }
    }
}

/// The order as filled. A market order acknowledged with nothing filled is
/// re-read once; if it still shows no fill, nothing may be booked against it.
async fn confirmed_fill(adapter: &dyn ExchangeAdapter, report: OrderReport) -> Option<OrderReport> {
    if report.filled_qty > Decimal::ZERO {
        return Some(report);
    }
    match adapter.fetch_order(&report.order_id, &report.symbol).await {
        Ok(latest) if latest.filled_qty > Decimal::ZERO => Some(latest),
        Ok(latest) => {
            warn!(
                "Order {} for {} is {} with nothing filled",
                latest.order_id, latest.symbol, latest.status
            );
            None
        }
        Err(e) => {
            warn!("Fill of order {} unconfirmed: {}", report.order_id, e);
            None
        }
    }
}

/// Reported average price, else last price, else what the signal expected.
async fn fill_price(adapter: &dyn ExchangeAdapter, report: &OrderReport, fallback: Decimal) -> Decimal {
    if let Some(price) = report.avg_price.filter(|p| *p > Decimal::ZERO) {
        return price;
    }
    match adapter.fetch_ticker(&report.symbol).await {
        Ok(ticker) if ticker.last > Decimal::ZERO => ticker.last,
        _ => fallback,
    }
}
