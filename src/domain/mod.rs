pub mod contracts;
pub mod order;
pub mod pnl;
pub mod position;
pub mod signal;
pub mod venue;

pub use order::*;
pub use pnl::{calc_pnl, PnLResult, PnlInput};
pub use position::Position;
pub use signal::{PositionIntent, Signal};
pub use venue::{base_asset, is_option_symbol, parse_venue_id, InstrumentKind, VenueId, VenueSpec};
