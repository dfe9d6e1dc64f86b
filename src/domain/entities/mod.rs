pub mod position;
pub mod risk_state;
pub mod signal;
pub mod snapshot;
pub mod survival_state;
pub mod trade;

pub use position::{Position, PositionStatus};
pub use risk_state::{RiskDecision, RiskMode, RiskSeverity, RiskState};
pub use signal::{ExitAction, ExitSignal, UrgentExit, Urgency};
pub use snapshot::AgentSnapshot;
pub use survival_state::{HealthCheck, HealthStatus, ReservePurchase, SurvivalAction, SurvivalState};
pub use trade::ClosedTrade;
