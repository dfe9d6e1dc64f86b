pub mod position_ledger;
pub mod risk_guardrail;
pub mod survival_allocator;

pub use position_ledger::PositionBook;
pub use risk_guardrail::RiskGuardrail;
pub use survival_allocator::SurvivalAllocator;
