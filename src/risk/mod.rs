mod actor;
mod manager;

pub use actor::{RiskCommand, RiskHandle};
pub use manager::{
    DailyPnl, Decision, DenyReason, PauseKind, PauseState, PnlCategory, RealizedPnl,
    RecordOpenOutcome, RiskManager, RiskSnapshot, VenueCapital,
};
