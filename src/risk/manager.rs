//! Risk gatekeeper and position book.
//!
//! `RiskManager` is a plain state machine with no I/O. It is owned by a
//! single task (see [`super::RiskHandle`]); every approval and every
//! position mutation, including reconciliation's, goes through it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::domain::{Position, Signal, VenueId};

/// Why an opening signal was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenyReason {
    #[error("trading paused: {0}")]
    Paused(String),

    #[error("win rate {win_rate} over last {window} results is below {min}")]
    WinRateBreaker {
        win_rate: Decimal,
        window: usize,
        min: Decimal,
    },

    #[error("{open} positions open, limit {max}")]
    MaxOpenPositions { open: usize, max: usize },

    #[error("{open} positions open on {venue}, limit {max}")]
    MaxVenuePositions {
        venue: VenueId,
        open: usize,
        max: usize,
    },

    #[error("position already open for {0}")]
    SymbolAlreadyOpen(String),

    #[error("{symbol} cooling down for {remaining_secs}s")]
    Cooldown { symbol: String, remaining_secs: i64 },

    #[error("no capital known for {0}")]
    NoCapital(VenueId),

    #[error("available balance {available} on {venue} below minimum {required}")]
    InsufficientBalance {
        venue: VenueId,
        available: Decimal,
        required: Decimal,
    },

    #[error("collateral {collateral} exceeds per-trade cap {cap}")]
    TradeCollateral { collateral: Decimal, cap: Decimal },

    #[error("exposure {exposure} would exceed cap {cap}")]
    TotalExposure { exposure: Decimal, cap: Decimal },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOpenOutcome {
    Recorded,
    /// A position for the symbol already existed; the new one was not added
    Duplicate,
}

/// P&L bucket a strategy books into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlCategory {
    Directional,
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseKind {
    Manual,
    WinRate,
    DailyLoss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub kind: PauseKind,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VenueCapital {
    pub total: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub total: Decimal,
    pub directional: Decimal,
    pub overlay: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyPnl {
    pub date: Option<NaiveDate>,
    pub realized: Decimal,
    pub wins: u32,
    pub losses: u32,
}

/// Point-in-time copy of risk state for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub positions: Vec<Position>,
    pub capital: BTreeMap<VenueId, VenueCapital>,
    pub realized: RealizedPnl,
    pub daily: DailyPnl,
    pub pause: Option<PauseState>,
    pub win_rate: Option<Decimal>,
    pub results_recorded: usize,
    pub win_rate_bypass: bool,
    pub open_collateral: Decimal,
}

pub struct RiskManager {
    config: RiskConfig,
    capital: BTreeMap<VenueId, VenueCapital>,
    positions: Vec<Position>,
    results: VecDeque<bool>,
    results_recorded: usize,
    pause: Option<PauseState>,
    win_rate_bypass: bool,
    cooldown_until: HashMap<String, DateTime<Utc>>,
    last_closed: HashMap<String, DateTime<Utc>>,
    realized: RealizedPnl,
    daily: DailyPnl,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            capital: BTreeMap::new(),
            positions: Vec::new(),
            results: VecDeque::new(),
            results_recorded: 0,
            pause: None,
            win_rate_bypass: false,
            cooldown_until: HashMap::new(),
            last_closed: HashMap::new(),
            realized: RealizedPnl::default(),
            daily: DailyPnl::default(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn approve(&mut self, signal: &Signal) -> Decision {
        self.approve_at(signal, Utc::now())
    }

    /// Approve or deny a signal. Exits are always approved.
    pub fn approve_at(&mut self, signal: &Signal, now: DateTime<Utc>) -> Decision {
        if signal.is_exit() {
            return Decision::Allow;
        }

        self.ensure_daily_reset(now);

        match self.check_entry(signal, now) {
            Ok(()) => {
                let cooldown = Duration::seconds(self.config.entry_cooldown_secs as i64);
                self.cooldown_until
                    .insert(signal.symbol.clone(), now + cooldown);
                Decision::Allow
            }
            Err(reason) => {
                info!(
                    symbol = %signal.symbol,
                    venue = %signal.venue,
                    strategy = %signal.strategy_id,
                    "signal denied: {}",
                    reason
                );
                Decision::Deny(reason)
            }
        }
    }

    fn check_entry(&mut self, signal: &Signal, now: DateTime<Utc>) -> Result<(), DenyReason> {
        if signal.price <= Decimal::ZERO || signal.quantity <= Decimal::ZERO {
            return Err(DenyReason::InvalidSignal(format!(
                "price {} quantity {}",
                signal.price, signal.quantity
            )));
        }

        if let Some(pause) = &self.pause {
            return Err(DenyReason::Paused(pause.reason.clone()));
        }

        if !self.win_rate_bypass && self.results_recorded >= self.config.win_rate_min_results {
            if let Some(win_rate) = self.win_rate() {
                if win_rate < self.config.min_win_rate {
                    let reason = DenyReason::WinRateBreaker {
                        win_rate,
                        window: self.results.len(),
                        min: self.config.min_win_rate,
                    };
                    warn!("win-rate breaker tripped: {}", reason);
                    self.pause = Some(PauseState {
                        reason: reason.to_string(),
                        kind: PauseKind::WinRate,
                        since: now,
                    });
                    return Err(reason);
                }
            }
        }

        if self.positions.len() >= self.config.max_open_positions {
            return Err(DenyReason::MaxOpenPositions {
                open: self.positions.len(),
                max: self.config.max_open_positions,
            });
        }

        let on_venue = self
            .positions
            .iter()
            .filter(|p| p.venue == signal.venue)
            .count();
        if on_venue >= self.config.max_positions_per_venue {
            return Err(DenyReason::MaxVenuePositions {
                venue: signal.venue,
                open: on_venue,
                max: self.config.max_positions_per_venue,
            });
        }

        if self.position(&signal.symbol).is_some() {
            return Err(DenyReason::SymbolAlreadyOpen(signal.symbol.clone()));
        }

        if let Some(until) = self.cooldown_until.get(&signal.symbol) {
            if *until > now {
                return Err(DenyReason::Cooldown {
                    symbol: signal.symbol.clone(),
                    remaining_secs: (*until - now).num_seconds().max(1),
                });
            }
        }

        let venue_capital = self
            .capital
            .get(&signal.venue)
            .copied()
            .ok_or(DenyReason::NoCapital(signal.venue))?;
        if venue_capital.available < self.config.min_available_balance {
            return Err(DenyReason::InsufficientBalance {
                venue: signal.venue,
                available: venue_capital.available,
                required: self.config.min_available_balance,
            });
        }

        let collateral = signal.collateral();
        let trade_cap = venue_capital.total * self.config.max_trade_collateral_pct;
        if collateral > trade_cap * (Decimal::ONE + self.config.trade_collateral_tolerance) {
            return Err(DenyReason::TradeCollateral {
                collateral,
                cap: trade_cap,
            });
        }

        let exposure = self.open_collateral() + collateral;
        let exposure_cap = self.total_capital() * self.config.max_total_exposure_pct;
        if exposure > exposure_cap {
            return Err(DenyReason::TotalExposure {
                exposure,
                cap: exposure_cap,
            });
        }

        Ok(())
    }

    /// Record a confirmed fill. A second position for the same symbol is refused.
    pub fn record_open(&mut self, position: Position) -> RecordOpenOutcome {
        if let Some(existing) = self.position(&position.symbol) {
            tracing::error!(
                symbol = %position.symbol,
                venue = %position.venue,
                existing_strategy = %existing.strategy_id,
                strategy = %position.strategy_id,
                "duplicate open for symbol; keeping existing position"
            );
            return RecordOpenOutcome::Duplicate;
        }

        info!(
            symbol = %position.symbol,
            venue = %position.venue,
            strategy = %position.strategy_id,
            qty = %position.quantity,
            entry = %position.entry_price,
            collateral = %position.collateral,
            "position opened"
        );
        self.positions.push(position);
        RecordOpenOutcome::Recorded
    }

    pub fn record_close(&mut self, symbol: &str, pnl: Decimal) -> Option<Position> {
        self.record_close_at(symbol, pnl, Utc::now())
    }

    /// Book realized P&L and drop the first position for `symbol`.
    ///
    /// Zero P&L records no win/loss result. A close for a symbol that is not
    /// tracked books nothing; the close it belongs to was already counted.
    pub fn record_close_at(
        &mut self,
        symbol: &str,
        pnl: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Position> {
        self.ensure_daily_reset(now);

        let Some(idx) = self.positions.iter().position(|p| p.symbol == symbol) else {
            warn!(symbol, pnl = %pnl, "close for untracked symbol ignored");
            return None;
        };
        let removed = self.positions.remove(idx);
        let category = self.category_for(&removed.strategy_id);

        self.realized.total += pnl;
        match category {
            PnlCategory::Directional => self.realized.directional += pnl,
            PnlCategory::Overlay => self.realized.overlay += pnl,
        }

        if !pnl.is_zero() {
            let win = pnl > Decimal::ZERO;
            self.results.push_back(win);
            while self.results.len() > self.config.win_rate_window {
                self.results.pop_front();
            }
            self.results_recorded += 1;

            self.daily.realized += pnl;
            if win {
                self.daily.wins += 1;
                if self.win_rate_bypass {
                    info!("winning close clears win-rate bypass");
                }
                self.win_rate_bypass = false;
            } else {
                self.daily.losses += 1;
            }
        }

        if let Some(capital) = self.capital.get_mut(&removed.venue) {
            capital.total += pnl;
            capital.available += pnl;
        }

        self.last_closed.insert(symbol.to_string(), now);

        info!(
            symbol,
            pnl = %pnl,
            category = ?category,
            "position closed"
        );

        if let Some(limit) = self.config.daily_loss_limit {
            if self.daily.realized <= -limit && self.pause.is_none() {
                warn!(daily = %self.daily.realized, limit = %limit, "daily loss limit reached");
                self.pause = Some(PauseState {
                    reason: format!("daily loss {} reached limit {}", self.daily.realized, limit),
                    kind: PauseKind::DailyLoss,
                    since: now,
                });
            }
        }

        Some(removed)
    }

    pub fn pause(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("trading paused: {}", reason);
        self.pause = Some(PauseState {
            reason,
            kind: PauseKind::Manual,
            since: Utc::now(),
        });
    }

    /// Resume trading. `force` also bypasses the win-rate breaker until the next win.
    pub fn unpause(&mut self, force: bool) {
        info!(force, "trading resumed");
        self.pause = None;
        if force {
            self.win_rate_bypass = true;
        }
    }

    pub fn update_capital(&mut self, venue: VenueId, total: Decimal, available: Decimal) {
        self.capital.insert(venue, VenueCapital { total, available });
    }

    /// Block new entries on `symbol` until `until` (never shortens an existing cooldown).
    pub fn set_cooldown(&mut self, symbol: &str, until: DateTime<Utc>) {
        let entry = self
            .cooldown_until
            .entry(symbol.to_string())
            .or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn last_closed_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_closed.get(symbol).copied()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    /// Win rate over the trailing window, if any results exist
    pub fn win_rate(&self) -> Option<Decimal> {
        if self.results.is_empty() {
            return None;
        }
        let wins = self.results.iter().filter(|w| **w).count();
        Some(Decimal::from(wins) / Decimal::from(self.results.len()))
    }

    pub fn open_collateral(&self) -> Decimal {
        self.positions.iter().map(|p| p.collateral).sum()
    }

    pub fn total_capital(&self) -> Decimal {
        self.capital.values().map(|c| c.total).sum()
    }

    pub fn capital(&self, venue: VenueId) -> Option<VenueCapital> {
        self.capital.get(&venue).copied()
    }

    pub fn realized(&self) -> &RealizedPnl {
        &self.realized
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            positions: self.positions.clone(),
            capital: self.capital.clone(),
            realized: self.realized.clone(),
            daily: self.daily.clone(),
            pause: self.pause.clone(),
            win_rate: self.win_rate(),
            results_recorded: self.results_recorded,
            win_rate_bypass: self.win_rate_bypass,
            open_collateral: self.open_collateral(),
        }
    }

    fn category_for(&self, strategy_id: &str) -> PnlCategory {
        if self
            .config
            .overlay_strategies
            .iter()
            .any(|s| s == strategy_id)
        {
            PnlCategory::Overlay
        } else {
            PnlCategory::Directional
        }
    }

    fn ensure_daily_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.daily.date != Some(today) {
            self.daily = DailyPnl {
                date: Some(today),
                ..Default::default()
            };
            if matches!(&self.pause, Some(p) if p.kind == PauseKind::DailyLoss) {
                info!("new trading day, lifting daily loss pause");
                self.pause = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionIntent;
    use rust_decimal_macros::dec;

    fn test_config() -> RiskConfig {
        RiskConfig {
            max_open_positions: 3,
            max_positions_per_venue: 2,
            entry_cooldown_secs: 60,
            min_available_balance: dec!(10),
            max_trade_collateral_pct: dec!(0.10),
            trade_collateral_tolerance: dec!(0.05),
            max_total_exposure_pct: dec!(0.50),
            win_rate_window: 20,
            win_rate_min_results: 20,
            min_win_rate: dec!(0.40),
            daily_loss_limit: None,
            overlay_strategies: vec!["hedge".to_string()],
        }
    }

    fn manager() -> RiskManager {
        let mut rm = RiskManager::new(test_config());
        rm.update_capital(VenueId::Bybit, dec!(1000), dec!(1000));
        rm.update_capital(VenueId::Delta, dec!(1000), dec!(1000));
        rm
    }

    /// Long on Bybit with the given collateral at 10x
    fn entry(symbol: &str, collateral: Decimal) -> Signal {
        Signal::entry(
            "trend",
            VenueId::Bybit,
            symbol,
            PositionIntent::Long,
            dec!(100),
            collateral * dec!(10) / dec!(100),
            10,
        )
    }

    fn open(rm: &mut RiskManager, signal: &Signal) {
        let pos = Position::from_fill(signal, signal.price, signal.quantity, Utc::now());
        assert_eq!(rm.record_open(pos), RecordOpenOutcome::Recorded);
    }

    /// Open and close a one-unit position on `symbol` for `pnl`.
    fn round_trip_at(rm: &mut RiskManager, symbol: &str, pnl: Decimal, now: DateTime<Utc>) {
        let pos = Position::new(
            symbol,
            VenueId::Bybit,
            PositionIntent::Long,
            dec!(100),
            dec!(1),
            1,
            "trend",
            now,
        );
        assert_eq!(rm.record_open(pos), RecordOpenOutcome::Recorded);
        assert!(rm.record_close_at(symbol, pnl, now).is_some());
    }

    fn record_results(rm: &mut RiskManager, wins: usize, losses: usize) {
        for _ in 0..wins {
            round_trip_at(rm, "X", dec!(1), Utc::now());
        }
        for _ in 0..losses {
            round_trip_at(rm, "X", dec!(-1), Utc::now());
        }
    }

    #[test]
    fn test_exit_always_approved() {
        let mut rm = manager();
        rm.pause("maintenance");
        let pos = Position::from_fill(&entry("BTCUSDT", dec!(50)), dec!(100), dec!(5), Utc::now());
        let exit = Signal::exit(&pos, dec!(90));
        assert!(exit.is_exit());
        assert_eq!(rm.approve(&exit), Decision::Allow);
    }

    #[test]
    fn test_pause_denies_entries() {
        let mut rm = manager();
        rm.pause("maintenance");
        let decision = rm.approve(&entry("BTCUSDT", dec!(50)));
        assert!(matches!(decision, Decision::Deny(DenyReason::Paused(_))));

        rm.unpause(false);
        assert!(rm.approve(&entry("BTCUSDT", dec!(50))).is_allowed());
    }

    #[test]
    fn test_collateral_cap_boundary() {
        // venue capital 1000, cap 10% = 100, tolerance 5% => 105 allowed
        let mut rm = manager();
        assert!(rm.approve(&entry("BTCUSDT", dec!(105))).is_allowed());

        let decision = rm.approve(&entry("ETHUSDT", dec!(105.1)));
        assert!(matches!(
            decision,
            Decision::Deny(DenyReason::TradeCollateral { .. })
        ));
    }

    #[test]
    fn test_total_exposure_cap() {
        let mut config = test_config();
        config.max_open_positions = 10;
        config.max_positions_per_venue = 10;
        let mut rm = RiskManager::new(config);
        rm.update_capital(VenueId::Bybit, dec!(1000), dec!(1000));

        // cap = 50% of 1000 = 500; five trades of 100 fit, the sixth does not
        for i in 0..5 {
            let signal = entry(&format!("S{i}USDT"), dec!(100));
            assert!(rm.approve(&signal).is_allowed());
            open(&mut rm, &signal);
        }
        assert_eq!(rm.open_collateral(), dec!(500));

        let decision = rm.approve(&entry("S5USDT", dec!(1)));
        assert!(matches!(
            decision,
            Decision::Deny(DenyReason::TotalExposure { .. })
        ));
    }

    #[test]
    fn test_position_caps_and_symbol_uniqueness() {
        let mut rm = manager();
        let btc = entry("BTCUSDT", dec!(10));
        assert!(rm.approve(&btc).is_allowed());
        open(&mut rm, &btc);

        let again = rm.approve_at(&btc, Utc::now() + Duration::hours(1));
        assert_eq!(
            again,
            Decision::Deny(DenyReason::SymbolAlreadyOpen("BTCUSDT".to_string()))
        );

        let eth = entry("ETHUSDT", dec!(10));
        assert!(rm.approve(&eth).is_allowed());
        open(&mut rm, &eth);

        let sol = entry("SOLUSDT", dec!(10));
        assert!(matches!(
            rm.approve(&sol),
            Decision::Deny(DenyReason::MaxVenuePositions { open: 2, .. })
        ));

        let delta = Signal::entry(
            "trend",
            VenueId::Delta,
            "ETHUSD",
            PositionIntent::Short,
            dec!(2000),
            dec!(0.05),
            10,
        );
        assert!(rm.approve(&delta).is_allowed());
        // 5 contracts of 0.01 ETH
        let pos = Position::from_fill(&delta, dec!(2000), dec!(5), Utc::now());
        open_position(&mut rm, pos);

        let fourth = Signal::entry(
            "trend",
            VenueId::Delta,
            "BTCUSD",
            PositionIntent::Long,
            dec!(50000),
            dec!(0.001),
            10,
        );
        assert!(matches!(
            rm.approve(&fourth),
            Decision::Deny(DenyReason::MaxOpenPositions { open: 3, max: 3 })
        ));
    }

    fn open_position(rm: &mut RiskManager, pos: Position) {
        assert_eq!(rm.record_open(pos), RecordOpenOutcome::Recorded);
    }

    #[test]
    fn test_entry_cooldown_rejects_racing_ticks() {
        let mut rm = manager();
        let now = Utc::now();
        let signal = entry("BTCUSDT", dec!(10));
        assert!(rm.approve_at(&signal, now).is_allowed());

        // second tick before any fill
        assert!(matches!(
            rm.approve_at(&signal, now + Duration::seconds(1)),
            Decision::Deny(DenyReason::Cooldown { .. })
        ));
        assert!(rm
            .approve_at(&signal, now + Duration::seconds(61))
            .is_allowed());
    }

    #[test]
    fn test_balance_requirements() {
        let mut rm = RiskManager::new(test_config());
        assert_eq!(
            rm.approve(&entry("BTCUSDT", dec!(10))),
            Decision::Deny(DenyReason::NoCapital(VenueId::Bybit))
        );

        rm.update_capital(VenueId::Bybit, dec!(1000), dec!(5));
        assert!(matches!(
            rm.approve(&entry("BTCUSDT", dec!(10))),
            Decision::Deny(DenyReason::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_win_rate_breaker_needs_twenty_results() {
        let mut rm = manager();
        // 19 results at ~31% win rate: breaker must not fire
        record_results(&mut rm, 6, 13);
        assert!(rm.approve(&entry("BTCUSDT", dec!(10))).is_allowed());

        // 20th result: 6/20 = 30% < 40%
        record_results(&mut rm, 0, 1);
        let decision = rm.approve(&entry("ETHUSDT", dec!(10)));
        assert!(matches!(
            decision,
            Decision::Deny(DenyReason::WinRateBreaker { .. })
        ));
        assert!(rm.is_paused());
    }

    #[test]
    fn test_win_rate_at_threshold_is_allowed() {
        let mut rm = manager();
        record_results(&mut rm, 8, 12);
        assert_eq!(rm.win_rate(), Some(dec!(0.4)));
        assert!(rm.approve(&entry("BTCUSDT", dec!(10))).is_allowed());
    }

    #[test]
    fn test_forced_resume_bypasses_until_next_win() {
        let mut rm = manager();
        record_results(&mut rm, 2, 18);
        assert!(!rm.approve(&entry("BTCUSDT", dec!(10))).is_allowed());

        rm.unpause(true);
        assert!(rm.approve(&entry("BTCUSDT", dec!(10))).is_allowed());

        // losses keep the bypass alive
        record_results(&mut rm, 0, 1);
        assert!(rm.approve(&entry("ETHUSDT", dec!(10))).is_allowed());

        // a win clears it; win rate is still poor so the breaker fires again
        record_results(&mut rm, 1, 0);
        assert!(matches!(
            rm.approve(&entry("SOLUSDT", dec!(10))),
            Decision::Deny(DenyReason::WinRateBreaker { .. })
        ));
    }

    #[test]
    fn test_round_trip_with_zero_pnl_restores_state() {
        let mut rm = manager();
        let before_positions = rm.positions().to_vec();
        let before_capital = rm.capital(VenueId::Bybit);

        let signal = entry("BTCUSDT", dec!(10));
        open(&mut rm, &signal);
        rm.record_close("BTCUSDT", Decimal::ZERO);

        assert_eq!(rm.positions(), before_positions.as_slice());
        assert_eq!(rm.capital(VenueId::Bybit), before_capital);
        assert_eq!(rm.snapshot().results_recorded, 0);
    }

    #[test]
    fn test_duplicate_open_is_refused() {
        let mut rm = manager();
        let signal = entry("BTCUSDT", dec!(10));
        open(&mut rm, &signal);
        let dup = Position::from_fill(&signal, dec!(101), dec!(1), Utc::now());
        assert_eq!(rm.record_open(dup), RecordOpenOutcome::Duplicate);
        assert_eq!(rm.positions().len(), 1);
        assert_eq!(rm.positions()[0].entry_price, dec!(100));
    }

    #[test]
    fn test_close_books_category_and_capital() {
        let mut rm = manager();
        let trend = entry("BTCUSDT", dec!(10));
        open(&mut rm, &trend);
        let hedge = Signal::entry(
            "hedge",
            VenueId::Delta,
            "C-BTC-90000-310125",
            PositionIntent::Long,
            dec!(500),
            dec!(10),
            1,
        );
        open(&mut rm, &hedge);

        rm.record_close("BTCUSDT", dec!(12.5));
        rm.record_close("C-BTC-90000-310125", dec!(-2));

        let realized = rm.realized();
        assert_eq!(realized.total, dec!(10.5));
        assert_eq!(realized.directional, dec!(12.5));
        assert_eq!(realized.overlay, dec!(-2));
        assert_eq!(rm.capital(VenueId::Bybit).unwrap().total, dec!(1012.5));
        assert_eq!(rm.capital(VenueId::Delta).unwrap().total, dec!(998));
        assert!(rm.positions().is_empty());
        assert!(rm.last_closed_at("BTCUSDT").is_some());
    }

    #[test]
    fn test_daily_loss_limit_pauses_until_next_day() {
        let mut config = test_config();
        config.daily_loss_limit = Some(dec!(50));
        let mut rm = RiskManager::new(config);
        rm.update_capital(VenueId::Bybit, dec!(1000), dec!(1000));

        let now = Utc::now();
        round_trip_at(&mut rm, "X", dec!(-30), now);
        assert!(!rm.is_paused());
        round_trip_at(&mut rm, "X", dec!(-25), now);
        assert!(rm.is_paused());

        let tomorrow = now + Duration::days(1);
        assert!(rm.approve_at(&entry("BTCUSDT", dec!(10)), tomorrow).is_allowed());
    }

    #[test]
    fn test_close_for_untracked_symbol_books_nothing() {
        let mut rm = manager();
        round_trip_at(&mut rm, "ETHUSDT", dec!(-1.1), Utc::now());
        let before = rm.snapshot();

        assert!(rm.record_close("ETHUSDT", dec!(-0.75)).is_none());

        let after = rm.snapshot();
        assert_eq!(after.results_recorded, before.results_recorded);
        assert_eq!(after.realized.total, before.realized.total);
        assert_eq!(after.daily.realized, before.daily.realized);
        assert_eq!(after.capital, before.capital);
    }

    #[test]
    fn test_cooldown_never_shortened() {
        let mut rm = manager();
        let now = Utc::now();
        rm.set_cooldown("BTCUSDT", now + Duration::minutes(5));
        rm.set_cooldown("BTCUSDT", now + Duration::minutes(1));
        assert!(matches!(
            rm.approve_at(&entry("BTCUSDT", dec!(10)), now + Duration::minutes(2)),
            Decision::Deny(DenyReason::Cooldown { .. })
        ));
    }
}
