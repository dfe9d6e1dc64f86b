pub mod entry_signals;
pub mod live_prices;
pub mod market_data;
pub mod state_store;
pub mod trade_executor;

pub use entry_signals::{EntryCandidate, EntrySignalSource, NoEntrySignals};
pub use live_prices::{LivePriceSource, PriceObservation, PriceSource};
pub use market_data::{MarketData, MarketDataResult, Quote};
pub use state_store::{StateStore, StoreError, StoreResult};
pub use trade_executor::{BuyFill, ExecutionResult, SellFill, TradeExecutor};
