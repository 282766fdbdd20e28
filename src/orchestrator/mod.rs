//! Planning, execution and event fan-out for one active graph

pub mod bus;
pub mod orchestrator;
pub mod planner;

pub use bus::{EventBus, Listener, Subscription};
pub use orchestrator::{Orchestrator, OrchestratorMode, OrchestratorState};
pub use planner::{PlanOutcome, PlanRequest, PlanValidation, Planner, StaticPlanner};
