use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::{ReconciliationReport, RestoredPosition, StrategyState};
use crate::config::ReconciliationConfig;
use crate::domain::{calc_pnl, PnlInput, Position, PositionIntent, Side, VenueId};
use crate::error::Result;
use crate::exchange::{ExchangeAdapter, ExchangeResult, VenuePosition};
use crate::execution::TradeExecutor;
use crate::ledger::{ExitReason, NewTradeRow, TradeClose, TradeRow};

/// Strategy id recorded on ledger rows for flattened orphans
const ORPHAN_STRATEGY: &str = "orphan";

/// Heals divergence between venues, the ledger and the risk manager.
pub struct ReconciliationLoop {
    executor: Arc<TradeExecutor>,
    strategies: HashMap<String, Arc<dyn StrategyState>>,
    config: ReconciliationConfig,
}

impl ReconciliationLoop {
    pub fn new(executor: Arc<TradeExecutor>, config: ReconciliationConfig) -> Self {
        Self {
            executor,
            strategies: HashMap::new(),
            config,
        }
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn StrategyState>) {
        self.strategies.insert(strategy.id().to_string(), strategy);
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn StrategyState>) -> Self {
        self.register_strategy(strategy);
        self
    }

    /// Reconcile on the configured interval until shutdown.
    ///
    /// The first pass happens one interval after the call; run
    /// [`reconcile_once`](Self::reconcile_once) at startup before strategies tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting reconciliation loop (interval: {}s)",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciliation loop stopped");
                        return;
                    }
                    continue;
                }
            }

            match self.reconcile_once().await {
                Ok(report) => report.log(),
                Err(e) => error!("Reconciliation failed: {}", e),
            }
        }
    }

    /// One full pass over every registered venue, then the ghost sweep.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = ReconciliationReport::new(now);

        let registry = self.executor.venues();
        let venues: Vec<VenueId> = registry.venues().collect();
        let mut adapters = Vec::with_capacity(venues.len());
        for venue in &venues {
            adapters.push(registry.adapter(*venue)?.clone());
        }

        let fetched: Vec<ExchangeResult<Vec<VenuePosition>>> =
            join_all(adapters.iter().map(|a| a.fetch_open_positions())).await;

        for ((venue, adapter), live) in venues.iter().zip(&adapters).zip(fetched) {
            let live = match live {
                Ok(live) => live,
                Err(e) => {
                    warn!("Skipping {} this pass: position fetch failed: {}", venue, e);
                    report.venues_skipped.push(*venue);
                    continue;
                }
            };
            self.refresh_capital(*venue, adapter.as_ref()).await?;
            self.reconcile_venue(*venue, adapter.as_ref(), &live, now, &mut report)
                .await?;
        }

        self.sweep_ghosts(now, &mut report).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn refresh_capital(&self, venue: VenueId, adapter: &dyn ExchangeAdapter) -> Result<()> {
        let quote = self.executor.venues().spec(venue).quote_asset;
        match adapter.fetch_balance().await {
            Ok(balances) => {
                let (total, free) = balances
                    .get(quote)
                    .map(|b| (b.total, b.free))
                    .unwrap_or((Decimal::ZERO, Decimal::ZERO));
                self.executor
                    .risk()
                    .update_capital(venue, total, free)
                    .await
            }
            Err(e) => {
                warn!("Balance refresh for {} failed: {}", venue, e);
                Ok(())
            }
        }
    }

    async fn reconcile_venue(
        &self,
        venue: VenueId,
        adapter: &dyn ExchangeAdapter,
        live: &[VenuePosition],
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let tracked = self.executor.risk().positions().await?;

        for venue_position in live {
            if let Some(known) = tracked.iter().find(|p| p.symbol == venue_position.symbol) {
                if known.venue != venue {
                    warn!(
                        "{} open on {} but tracked on {}; leaving it alone",
                        venue_position.symbol, venue, known.venue
                    );
                }
                continue;
            }

            match self
                .executor
                .ledger()
                .get_open_trade_row(&venue_position.symbol, venue, None)
                .await
            {
                Ok(Some(row)) => {
                    self.restore(venue, adapter, venue_position, row, now, report)
                        .await?
                }
                Ok(None) => self.flatten_orphan(venue, venue_position, now, report).await,
                Err(e) => {
                    // without the ledger an orphan cannot be told from a forgotten trade
                    error!(
                        "Ledger unavailable while checking {} on {}: {}",
                        venue_position.symbol, venue, e
                    );
                }
            }
        }

        for position in tracked.into_iter().filter(|p| p.venue == venue) {
            if live.iter().any(|vp| vp.symbol == position.symbol) {
                continue;
            }
            self.heal_phantom(position, now, report).await?;
        }
        Ok(())
    }

    async fn restore(
        &self,
        venue: VenueId,
        adapter: &dyn ExchangeAdapter,
        venue_position: &VenuePosition,
        row: TradeRow,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let entry_price = if row.entry_price > Decimal::ZERO {
            row.entry_price
        } else {
            venue_position.entry_price
        };
        let position = Position::new(
            venue_position.symbol.clone(),
            venue,
            row.intent,
            entry_price,
            venue_position.quantity,
            row.leverage,
            row.strategy_id.clone(),
            row.opened_at,
        );

        let trailing_active = match adapter.fetch_ticker(&position.symbol).await {
            Ok(ticker) => self.trailing_armed(&position, ticker.last),
            Err(e) => {
                debug!("No ticker for {} during restore: {}", position.symbol, e);
                false
            }
        };

        let outcome = self.executor.risk().record_open(position.clone()).await?;
        if outcome == crate::risk::RecordOpenOutcome::Duplicate {
            return Ok(());
        }

        if let Some(strategy) = self.strategies.get(&position.strategy_id) {
            strategy
                .restore_position(&RestoredPosition {
                    symbol: position.symbol.clone(),
                    venue,
                    side: position.side,
                    intent: position.intent,
                    entry_price,
                    quantity: position.quantity,
                    leverage: position.leverage,
                    opened_at: position.opened_at,
                    held_for: position.held_for(now),
                    trailing_active,
                })
                .await;
        }

        info!(
            "Restored {} {} on {} for {} (entry {}, trailing {})",
            position.quantity,
            position.symbol,
            venue,
            position.strategy_id,
            entry_price,
            trailing_active
        );
        report.restored += 1;
        Ok(())
    }

    fn trailing_armed(&self, position: &Position, last: Decimal) -> bool {
        if position.entry_price <= Decimal::ZERO || last <= Decimal::ZERO {
            return false;
        }
        let favourable = match position.side {
            Side::Buy => last - position.entry_price,
            Side::Sell => position.entry_price - last,
        };
        favourable / position.entry_price >= self.config.trailing_activation_pct
    }

    async fn flatten_orphan(
        &self,
        venue: VenueId,
        venue_position: &VenuePosition,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) {
        let symbol = &venue_position.symbol;
        warn!(
            "Orphan {} {} on {} with no open trade row; flattening",
            venue_position.quantity, symbol, venue
        );

        let fill = match self
            .executor
            .flatten(venue, symbol, venue_position.side.opposite(), venue_position.quantity)
            .await
        {
            Ok(Some(fill)) => fill,
            Ok(None) => {
                debug!("Orphan {} on {} is below the lot step; left in place", symbol, venue);
                return;
            }
            Err(e) => {
                let message = format!(
                    "[bastion] ORPHAN CLOSE FAILED on {} {} ({}): {}",
                    venue, symbol, venue_position.quantity, e
                );
                error!("{}", message);
                self.executor.notify(&message);
                report.escalations.push(message);
                return;
            }
        };

        let spec = self.executor.venues().spec(venue);
        let intent = if spec.supports_spot {
            PositionIntent::Spot
        } else if venue_position.side == Side::Buy {
            PositionIntent::Long
        } else {
            PositionIntent::Short
        };
        let pnl = calc_pnl(&PnlInput {
            entry_price: venue_position.entry_price,
            exit_price: fill.price,
            quantity: fill.quantity,
            intent,
            leverage: 1,
            venue,
            symbol,
            entry_fee_rate: spec.taker_fee,
            exit_fee_rate: fill.fee_rate,
        });

        let row = NewTradeRow {
            symbol: symbol.clone(),
            venue,
            strategy_id: ORPHAN_STRATEGY.to_string(),
            side: venue_position.side,
            intent,
            leverage: 1,
            entry_price: venue_position.entry_price,
            entry_fee_rate: spec.taker_fee,
            quantity: fill.quantity,
            opened_at: now,
            close: Some(TradeClose {
                exit_price: fill.price,
                pnl: pnl.net_pnl,
                pnl_pct: pnl.pnl_pct,
                exit_reason: ExitReason::Orphan,
                closed_at: now,
            }),
        };
        if let Err(e) = self.executor.ledger().insert_trade_row(&row).await {
            error!("Failed to record orphan close of {}: {}", symbol, e);
        }

        self.executor.notify(&format!(
            "[bastion] orphan flattened on {}: {} {} @ {}",
            venue, fill.quantity, symbol, fill.price
        ));
        report.orphans_flattened += 1;
    }

    async fn heal_phantom(
        &self,
        position: Position,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let grace = ChronoDuration::seconds(self.config.open_grace_secs as i64);
        if position.held_for(now) < grace {
            debug!("{} missing on {} but inside open grace", position.symbol, position.venue);
            return Ok(());
        }

        let risk = self.executor.risk();
        if let Some(closed_at) = risk.last_closed_at(&position.symbol).await? {
            let recent = ChronoDuration::seconds(self.config.recent_close_secs as i64);
            if now - closed_at < recent {
                debug!("{} closed moments ago; not a phantom", position.symbol);
                return Ok(());
            }
        }

        warn!(
            "{} tracked but no longer open on {}; settling external close",
            position.symbol, position.venue
        );

        if let Some(strategy) = self.strategies.get(&position.strategy_id) {
            strategy.clear_position(&position.symbol).await;
        }
        let cooldown = ChronoDuration::seconds(self.config.reentry_cooldown_secs as i64);
        risk.set_cooldown(&position.symbol, now + cooldown).await?;

        self.executor
            .settle_external_close(&position, ExitReason::ExternalClose)
            .await?;
        report.phantoms_closed += 1;
        Ok(())
    }

    async fn sweep_ghosts(&self, now: DateTime<Utc>, report: &mut ReconciliationReport) -> Result<()> {
        let grace = ChronoDuration::seconds(self.config.open_grace_secs as i64);
        let risk = self.executor.risk();

        for position in risk.positions().await? {
            let Some(strategy) = self.strategies.get(&position.strategy_id) else {
                continue;
            };
            if position.held_for(now) < grace {
                continue;
            }
            if strategy.holds_position(&position.symbol).await {
                continue;
            }

            warn!(
                "Ghost {} on {}: {} no longer holds it; dropping from risk",
                position.symbol, position.venue, position.strategy_id
            );
            risk.record_close(&position.symbol, Decimal::ZERO).await?;
            report.ghosts_swept += 1;
        }
        Ok(())
    }
}
