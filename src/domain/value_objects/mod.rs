pub mod pnl;
pub mod price;
pub mod quantity;

pub use pnl::PnL;
pub use price::Price;
pub use quantity::Quantity;
