pub mod agent;
pub mod context;
pub mod ledger;
pub mod state_writer;

pub use agent::{Agent, EntryOutcome, TickReport};
pub use context::AgentContext;
pub use ledger::{Evaluation, PositionLedger, PricedSignal};
pub use state_writer::StateWriter;
