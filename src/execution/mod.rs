//! Order execution: sizing, venue retries, maker exits and fill bookkeeping.

mod executor;
mod maker_exit;
mod retry;

pub use executor::{size_entry, ExecutionOutcome, ExitFill, FillReport, TradeExecutor};
pub use maker_exit::{run_maker_exit, MakerExit};
pub use retry::{backoff_delay, with_retry, AttemptFailure, RetryPolicy};
