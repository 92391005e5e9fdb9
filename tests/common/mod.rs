#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use bastion::config::AppConfig;
use bastion::domain::{Position, PositionIntent, Signal, VenueId};
use bastion::engine::{SubmitOutcome, TradingCore};
use bastion::exchange::{PaperExchange, VenueRegistry};
use bastion::execution::{ExecutionOutcome, FillReport};
use bastion::ledger::MemoryLedger;
use bastion::notify::Notifier;
use bastion::reconcile::{RestoredPosition, StrategyState};

pub const STRATEGY: &str = "trend";

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send_text(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

pub struct TestStrategy {
    id: String,
    held: Mutex<HashSet<String>>,
    restored: Mutex<Vec<RestoredPosition>>,
}

impl TestStrategy {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            held: Mutex::new(HashSet::new()),
            restored: Mutex::new(Vec::new()),
        })
    }

    pub fn hold(&self, symbol: &str) {
        self.held.lock().unwrap().insert(symbol.to_string());
    }

    pub fn holds(&self, symbol: &str) -> bool {
        self.held.lock().unwrap().contains(symbol)
    }

    pub fn restored(&self) -> Vec<RestoredPosition> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl StrategyState for TestStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    async fn holds_position(&self, symbol: &str) -> bool {
        self.holds(symbol)
    }

    async fn restore_position(&self, position: &RestoredPosition) {
        self.hold(&position.symbol);
        self.restored.lock().unwrap().push(position.clone());
    }

    async fn clear_position(&self, symbol: &str) {
        self.held.lock().unwrap().remove(symbol);
    }
}

/// Three paper venues with millisecond backoff and a short maker wait.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default_config();
    config.execution.max_retries = 3;
    config.execution.base_backoff_ms = 1;
    config.execution.max_backoff_ms = 4;
    config.execution.maker_exit_wait_ms = 5;
    config
}

/// Like [`fast_config`] with every reconciliation guard window at zero.
pub fn eager_reconcile_config() -> AppConfig {
    let mut config = fast_config();
    config.reconciliation.open_grace_secs = 0;
    config.reconciliation.recent_close_secs = 0;
    config.risk.entry_cooldown_secs = 0;
    config
}

pub struct Harness {
    pub core: TradingCore,
    pub binance: Arc<PaperExchange>,
    pub bybit: Arc<PaperExchange>,
    pub delta: Arc<PaperExchange>,
    pub ledger: Arc<MemoryLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub strategy: Arc<TestStrategy>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let binance = Arc::new(PaperExchange::funded(VenueId::Binance, dec!(10000)).await);
        let bybit = Arc::new(PaperExchange::funded(VenueId::Bybit, dec!(10000)).await);
        let delta = Arc::new(PaperExchange::funded(VenueId::Delta, dec!(10000)).await);

        binance.set_ticker("BTC/USDT", dec!(50000)).await;
        bybit.set_ticker("BTCUSDT", dec!(50000)).await;
        bybit.set_ticker("ETHUSDT", dec!(2000)).await;
        bybit.set_ticker("SOLUSDT", dec!(150)).await;
        delta.set_ticker("BTCUSD", dec!(60000)).await;

        let venues = VenueRegistry::new()
            .with(binance.clone())
            .with(bybit.clone())
            .with(delta.clone());
        let ledger = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let strategy = TestStrategy::new(STRATEGY);

        let core = TradingCore::builder(config)
            .venues(venues)
            .ledger(ledger.clone())
            .notifier(notifier.clone())
            .strategy(strategy.clone())
            .build()
            .await
            .expect("core builds");

        // seeds per-venue capital
        core.reconciler()
            .reconcile_once()
            .await
            .expect("startup reconciliation");

        Self {
            core,
            binance,
            bybit,
            delta,
            ledger,
            notifier,
            strategy,
        }
    }

    pub async fn submit(&self, signal: &Signal) -> SubmitOutcome {
        self.core.submit_signal(signal).await.expect("submit")
    }

    /// Submit an entry that must fill; the strategy is told it holds it.
    pub async fn open(&self, signal: &Signal) -> FillReport {
        match self.submit(signal).await {
            SubmitOutcome::Executed(ExecutionOutcome::Filled(fill)) => {
                if signal.strategy_id == STRATEGY {
                    self.strategy.hold(&signal.symbol);
                }
                fill
            }
            other => panic!("expected a fill, got {:?}", other),
        }
    }

    pub async fn tracked(&self, symbol: &str) -> Option<Position> {
        self.core.risk().position(symbol).await.expect("risk task")
    }
}

pub fn long(venue: VenueId, symbol: &str, price: Decimal, quantity: Decimal, leverage: u32) -> Signal {
    Signal::entry(
        STRATEGY,
        venue,
        symbol,
        PositionIntent::Long,
        price,
        quantity,
        leverage,
    )
}

pub fn spot_buy(symbol: &str, price: Decimal, quantity: Decimal) -> Signal {
    Signal::entry(
        STRATEGY,
        VenueId::Binance,
        symbol,
        PositionIntent::Spot,
        price,
        quantity,
        1,
    )
}
