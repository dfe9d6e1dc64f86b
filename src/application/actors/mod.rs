pub mod feed_protocol;
pub mod price_feed;

pub use feed_protocol::{FeedMessageError, PriceTick, TradeSide, TradeTick};
pub use price_feed::{ConnectionState, FeedEvent, PriceCallback, PriceFeed, TradeCallback};
