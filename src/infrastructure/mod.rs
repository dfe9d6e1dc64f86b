pub mod entry_signal_client;
pub mod market_data_client;
pub mod paper_executor;

pub use entry_signal_client::HttpEntrySignals;
pub use market_data_client::HttpMarketData;
pub use paper_executor::PaperExecutor;
