pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod ledger;
pub mod notify;
pub mod reconcile;
pub mod risk;

pub use config::AppConfig;
pub use domain::{calc_pnl, PnLResult, Position, PositionIntent, Signal, VenueId};
pub use engine::{SubmitOutcome, TradingCore, TradingCoreBuilder};
pub use error::{BastionError, ExchangeError, ExecutionError, Result};
pub use exchange::{ExchangeAdapter, PaperExchange, VenueRegistry};
pub use execution::{ExecutionOutcome, FillReport, TradeExecutor};
pub use ledger::{Ledger, MemoryLedger, PostgresLedger};
pub use notify::{Notifier, WebhookNotifier};
pub use reconcile::{ReconciliationLoop, ReconciliationReport, RestoredPosition, StrategyState};
pub use risk::{Decision, DenyReason, RiskHandle, RiskManager, RiskSnapshot};
