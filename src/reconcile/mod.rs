//! Venue / ledger / memory reconciliation.
//!
//! - Restore venue positions the core forgot (ledger row still open)
//! - Flatten venue positions nothing knows about (orphans)
//! - Settle positions the venue closed on its own (phantoms)
//! - Drop positions their strategy no longer holds (ghosts)

mod reconciler;

pub use reconciler::ReconciliationLoop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{PositionIntent, Side, VenueId};

/// A position handed back to its strategy after a restart
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredPosition {
    pub symbol: String,
    pub venue: VenueId,
    pub side: Side,
    pub intent: PositionIntent,
    pub entry_price: Decimal,
    /// Venue-native quantity as the venue reports it
    pub quantity: Decimal,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
    pub held_for: chrono::Duration,
    /// Price already moved far enough in favour to arm the trailing stop
    pub trailing_active: bool,
}

/// The slice of a strategy task that reconciliation needs.
#[async_trait]
pub trait StrategyState: Send + Sync {
    /// Strategy id, as carried on signals and ledger rows
    fn id(&self) -> &str;

    async fn holds_position(&self, symbol: &str) -> bool;

    async fn restore_position(&self, position: &RestoredPosition);

    async fn clear_position(&self, symbol: &str);
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub restored: usize,
    pub orphans_flattened: usize,
    pub phantoms_closed: usize,
    pub ghosts_swept: usize,
    pub venues_skipped: Vec<VenueId>,
    pub escalations: Vec<String>,
    pub duration_ms: u64,
}

impl ReconciliationReport {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            restored: 0,
            orphans_flattened: 0,
            phantoms_closed: 0,
            ghosts_swept: 0,
            venues_skipped: Vec::new(),
            escalations: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Nothing diverged and every venue answered.
    pub fn is_clean(&self) -> bool {
        self.corrections() == 0 && self.venues_skipped.is_empty() && self.escalations.is_empty()
    }

    pub fn corrections(&self) -> usize {
        self.restored + self.orphans_flattened + self.phantoms_closed + self.ghosts_swept
    }

    pub fn log(&self) {
        if self.is_clean() {
            info!("Reconciliation clean ({}ms)", self.duration_ms);
            return;
        }
        warn!(
            "Reconciliation: {} restored, {} orphans flattened, {} phantoms closed, {} ghosts swept, {} venues skipped, {} escalations ({}ms)",
            self.restored,
            self.orphans_flattened,
            self.phantoms_closed,
            self.ghosts_swept,
            self.venues_skipped.len(),
            self.escalations.len(),
            self.duration_ms
        );
    }
}
