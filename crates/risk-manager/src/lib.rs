pub mod engine;
pub mod gate;
pub mod models;

pub use engine::{should_push_stop, PositionRiskEngine};
pub use gate::RiskGate;
pub use models::*;
