//! Single-owner task around [`RiskManager`].
//!
//! Strategy tasks, the executor and reconciliation all run concurrently on a
//! multi-threaded runtime; they talk to the one manager through a cloneable
//! [`RiskHandle`] and a single-consumer queue, so decisions are serialized.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::{Decision, RecordOpenOutcome, RiskManager, RiskSnapshot};
use crate::domain::{Position, Signal, VenueId};
use crate::error::{BastionError, Result};

const COMMAND_BUFFER: usize = 256;

/// Requests served by the risk task
#[derive(Debug)]
pub enum RiskCommand {
    Approve {
        signal: Box<Signal>,
        reply: oneshot::Sender<Decision>,
    },
    RecordOpen {
        position: Box<Position>,
        reply: oneshot::Sender<RecordOpenOutcome>,
    },
    RecordClose {
        symbol: String,
        pnl: Decimal,
        reply: oneshot::Sender<Option<Position>>,
    },
    Pause {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Unpause {
        force: bool,
        reply: oneshot::Sender<()>,
    },
    UpdateCapital {
        venue: VenueId,
        total: Decimal,
        available: Decimal,
        reply: oneshot::Sender<()>,
    },
    SetCooldown {
        symbol: String,
        until: DateTime<Utc>,
        reply: oneshot::Sender<()>,
    },
    LastClosed {
        symbol: String,
        reply: oneshot::Sender<Option<DateTime<Utc>>>,
    },
    Snapshot {
        reply: oneshot::Sender<RiskSnapshot>,
    },
}

impl RiskManager {
    fn handle(&mut self, command: RiskCommand) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match command {
            RiskCommand::Approve { signal, reply } => {
                let _ = reply.send(self.approve(&signal));
            }
            RiskCommand::RecordOpen { position, reply } => {
                let _ = reply.send(self.record_open(*position));
            }
            RiskCommand::RecordClose { symbol, pnl, reply } => {
                let _ = reply.send(self.record_close(&symbol, pnl));
            }
            RiskCommand::Pause { reason, reply } => {
                self.pause(reason);
                let _ = reply.send(());
            }
            RiskCommand::Unpause { force, reply } => {
                self.unpause(force);
                let _ = reply.send(());
            }
            RiskCommand::UpdateCapital {
                venue,
                total,
                available,
                reply,
            } => {
                self.update_capital(venue, total, available);
                let _ = reply.send(());
            }
            RiskCommand::SetCooldown {
                symbol,
                until,
                reply,
            } => {
                self.set_cooldown(&symbol, until);
                let _ = reply.send(());
            }
            RiskCommand::LastClosed { symbol, reply } => {
                let _ = reply.send(self.last_closed_at(&symbol));
            }
            RiskCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }
}

/// Cloneable access to the risk task
#[derive(Clone)]
pub struct RiskHandle {
    tx: mpsc::Sender<RiskCommand>,
}

impl RiskHandle {
    /// Move `manager` onto its own task. The task ends, returning the
    /// manager, once every handle is dropped.
    pub fn spawn(mut manager: RiskManager) -> (Self, JoinHandle<RiskManager>) {
        let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                manager.handle(command);
            }
            debug!("risk task stopped");
            manager
        });
        (Self { tx }, task)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RiskCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| BastionError::Internal("risk task is not running".to_string()))?;
        rx.await
            .map_err(|_| BastionError::Internal("risk task dropped the request".to_string()))
    }

    pub async fn approve(&self, signal: &Signal) -> Result<Decision> {
        let signal = Box::new(signal.clone());
        self.request(|reply| RiskCommand::Approve { signal, reply })
            .await
    }

    pub async fn record_open(&self, position: Position) -> Result<RecordOpenOutcome> {
        let position = Box::new(position);
        self.request(|reply| RiskCommand::RecordOpen { position, reply })
            .await
    }

    pub async fn record_close(&self, symbol: &str, pnl: Decimal) -> Result<Option<Position>> {
        let symbol = symbol.to_string();
        self.request(|reply| RiskCommand::RecordClose { symbol, pnl, reply })
            .await
    }

    pub async fn pause(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| RiskCommand::Pause { reason, reply })
            .await
    }

    pub async fn unpause(&self, force: bool) -> Result<()> {
        self.request(|reply| RiskCommand::Unpause { force, reply })
            .await
    }

    pub async fn update_capital(
        &self,
        venue: VenueId,
        total: Decimal,
        available: Decimal,
    ) -> Result<()> {
        self.request(|reply| RiskCommand::UpdateCapital {
            venue,
            total,
            available,
            reply,
        })
        .await
    }

    pub async fn set_cooldown(&self, symbol: &str, until: DateTime<Utc>) -> Result<()> {
        let symbol = symbol.to_string();
        self.request(|reply| RiskCommand::SetCooldown {
            symbol,
            until,
            reply,
        })
        .await
    }

    pub async fn last_closed_at(&self, symbol: &str) -> Result<Option<DateTime<Utc>>> {
        let symbol = symbol.to_string();
        self.request(|reply| RiskCommand::LastClosed { symbol, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<RiskSnapshot> {
        self.request(|reply| RiskCommand::Snapshot { reply }).await
    }

    pub async fn positions(&self) -> Result<Vec<Position>> {
        Ok(self.snapshot().await?.positions)
    }

    pub async fn position(&self, symbol: &str) -> Result<Option<Position>> {
        Ok(self
            .positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::domain::PositionIntent;
    use rust_decimal_macros::dec;

    async fn spawn_funded() -> (RiskHandle, JoinHandle<RiskManager>) {
        let (handle, task) = RiskHandle::spawn(RiskManager::new(RiskConfig::default()));
        handle
            .update_capital(VenueId::Bybit, dec!(10000), dec!(10000))
            .await
            .unwrap();
        (handle, task)
    }

    fn signal(symbol: &str) -> Signal {
        Signal::entry(
            "trend",
            VenueId::Bybit,
            symbol,
            PositionIntent::Long,
            dec!(100),
            dec!(1),
            5,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_entries_for_one_symbol() {
        let (handle, _task) = spawn_funded().await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let s = signal("BTCUSDT");
                if handle.approve(&s).await.unwrap().is_allowed() {
                    let pos = Position::from_fill(&s, s.price, s.quantity, Utc::now());
                    handle.record_open(pos).await.unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut approved = 0;
        for task in tasks {
            if task.await.unwrap() {
                approved += 1;
            }
        }

        assert_eq!(approved, 1);
        let positions = handle.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_returned_when_handles_dropped() {
        let (handle, task) = spawn_funded().await;
        let s = signal("ETHUSDT");
        assert!(handle.approve(&s).await.unwrap().is_allowed());
        handle
            .record_open(Position::from_fill(&s, dec!(100), dec!(1), Utc::now()))
            .await
            .unwrap();
        drop(handle);

        let manager = task.await.unwrap();
        assert_eq!(manager.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_close_via_handle() {
        let (handle, _task) = spawn_funded().await;
        handle.pause("operator").await.unwrap();
        assert!(handle.snapshot().await.unwrap().pause.is_some());
        assert!(!handle.approve(&signal("SOLUSDT")).await.unwrap().is_allowed());

        handle.unpause(false).await.unwrap();
        let s = signal("SOLUSDT");
        assert!(handle.approve(&s).await.unwrap().is_allowed());
        handle
            .record_open(Position::from_fill(&s, dec!(100), dec!(1), Utc::now()))
            .await
            .unwrap();

        let closed = handle.record_close("SOLUSDT", dec!(4)).await.unwrap();
        assert_eq!(closed.map(|p| p.symbol), Some("SOLUSDT".to_string()));
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.realized.total, dec!(4));
        assert_eq!(snapshot.capital[&VenueId::Bybit].total, dec!(10004));
        assert!(handle.last_closed_at("SOLUSDT").await.unwrap().is_some());
    }
}
