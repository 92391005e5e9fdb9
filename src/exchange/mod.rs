pub mod paper;
pub mod registry;
mod traits;

pub use paper::{LimitFillMode, PaperExchange};
pub use registry::{build_venue_registry, VenueRegistry};
pub use traits::{
    AssetBalance, Balances, ExchangeAdapter, ExchangeResult, OrderReport, OrderRequest,
    RecentFill, Ticker, VenuePosition,
};
