//! Wiring of the execution core.
//!
//! A strategy task hands a [`Signal`] to [`TradingCore::submit_signal`]; the
//! risk actor approves or denies it and approved signals go to the executor.
//! Reconciliation runs once at startup and then on its own interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::Signal;
use crate::error::Result;
use crate::exchange::{build_venue_registry, VenueRegistry};
use crate::execution::{ExecutionOutcome, TradeExecutor};
use crate::ledger::{Ledger, MemoryLedger, PostgresLedger};
use crate::notify::{Notifier, WebhookNotifier};
use crate::reconcile::{ReconciliationLoop, ReconciliationReport, StrategyState};
use crate::risk::{Decision, DenyReason, RiskHandle, RiskManager, RiskSnapshot};

const RISK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to a submitted signal
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Denied(DenyReason),
    Executed(ExecutionOutcome),
}

impl SubmitOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, SubmitOutcome::Executed(outcome) if outcome.is_filled())
    }
}

pub struct TradingCoreBuilder {
    config: AppConfig,
    venues: Option<VenueRegistry>,
    ledger: Option<Arc<dyn Ledger>>,
    notifier: Option<Arc<dyn Notifier>>,
    strategies: Vec<Arc<dyn StrategyState>>,
}

impl TradingCoreBuilder {
    pub fn venues(mut self, venues: VenueRegistry) -> Self {
        self.venues = Some(venues);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn StrategyState>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Fill in whatever was not supplied from config, spawn the risk task
    /// and assemble the core.
    pub async fn build(self) -> Result<TradingCore> {
        let config = self.config;

        let venues = match self.venues {
            Some(venues) => venues,
            None => build_venue_registry(&config).await?,
        };
        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => open_ledger(&config).await?,
        };
        let notifier = self.notifier.or_else(|| notifier_from_config(&config));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (risk, risk_task) = RiskHandle::spawn(RiskManager::new(config.risk.clone()));

        let executor = Arc::new(
            TradeExecutor::new(
                Arc::new(venues),
                risk.clone(),
                ledger,
                config.execution.clone(),
            )
            .with_notifier(notifier)
            .with_shutdown(shutdown_rx),
        );

        let mut reconciler =
            ReconciliationLoop::new(Arc::clone(&executor), config.reconciliation.clone());
        for strategy in self.strategies {
            reconciler.register_strategy(strategy);
        }

        Ok(TradingCore {
            config,
            risk,
            executor,
            reconciler: Arc::new(reconciler),
            shutdown_tx,
            risk_task,
            reconcile_task: None,
        })
    }
}

async fn open_ledger(config: &AppConfig) -> Result<Arc<dyn Ledger>> {
    match &config.database {
        Some(db) => {
            let ledger = PostgresLedger::new(&db.url, db.max_connections).await?;
            ledger.migrate().await?;
            Ok(Arc::new(ledger))
        }
        None => {
            warn!("No database configured; trade ledger is in memory only");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

fn notifier_from_config(config: &AppConfig) -> Option<Arc<dyn Notifier>> {
    let webhook = match config.notify.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Some(WebhookNotifier::new(url.to_string())),
        _ => WebhookNotifier::from_env(),
    };
    webhook.map(|n| n as Arc<dyn Notifier>)
}

/// The running execution core
pub struct TradingCore {
    config: AppConfig,
    risk: RiskHandle,
    executor: Arc<TradeExecutor>,
    reconciler: Arc<ReconciliationLoop>,
    shutdown_tx: watch::Sender<bool>,
    risk_task: JoinHandle<RiskManager>,
    reconcile_task: Option<JoinHandle<()>>,
}

impl TradingCore {
    pub fn builder(config: AppConfig) -> TradingCoreBuilder {
        TradingCoreBuilder {
            config,
            venues: None,
            ledger: None,
            notifier: None,
            strategies: Vec::new(),
        }
    }

    pub async fn from_config(config: AppConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn risk(&self) -> &RiskHandle {
        &self.risk
    }

    pub fn executor(&self) -> &Arc<TradeExecutor> {
        &self.executor
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationLoop> {
        &self.reconciler
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Approve, then execute.
    pub async fn submit_signal(&self, signal: &Signal) -> Result<SubmitOutcome> {
        match self.risk.approve(signal).await? {
            Decision::Deny(reason) => {
                info!(
                    "Signal denied: {} {} {} ({}): {}",
                    signal.strategy_id, signal.side, signal.symbol, signal.venue, reason
                );
                Ok(SubmitOutcome::Denied(reason))
            }
            Decision::Allow => {
                let outcome = self.executor.execute(signal).await?;
                Ok(SubmitOutcome::Executed(outcome))
            }
        }
    }

    /// Startup pass: run before any strategy ticks, then keep reconciling
    /// in the background.
    pub async fn start(&mut self) -> Result<ReconciliationReport> {
        let report = self.reconciler.reconcile_once().await?;
        report.log();

        let reconciler = Arc::clone(&self.reconciler);
        let shutdown = self.shutdown_receiver();
        self.reconcile_task = Some(tokio::spawn(async move {
            reconciler.run(shutdown).await;
        }));
        Ok(report)
    }

    pub async fn snapshot(&self) -> Result<RiskSnapshot> {
        self.risk.snapshot().await
    }

    /// Stop background work and collect the final risk state.
    ///
    /// In-flight exits finish; entries still retrying give up.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down execution core");
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.reconcile_task {
            if let Err(e) = task.await {
                error!("Reconciliation task ended abnormally: {}", e);
            }
        }

        let snapshot = self.risk.snapshot().await?;
        info!(
            "Final state: {} open positions, realized {} (directional {}, overlay {})",
            snapshot.positions.len(),
            snapshot.realized.total,
            snapshot.realized.directional,
            snapshot.realized.overlay
        );

        drop(self.reconciler);
        drop(self.executor);
        drop(self.risk);
        match tokio::time::timeout(RISK_DRAIN_TIMEOUT, self.risk_task).await {
            Ok(Ok(_)) => info!("Risk task drained"),
            Ok(Err(e)) => error!("Risk task ended abnormally: {}", e),
            Err(_) => warn!("Risk task still referenced by strategy tasks; not waiting"),
        }
        Ok(())
    }
}
