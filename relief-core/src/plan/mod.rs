pub mod error;
pub mod models;
pub mod planner;
pub mod rounding;

pub use error::{PlanError, PlanResult};
pub use models::{AllocationPlan, LineItem, PlanKpis};
pub use planner::{AllocationEngine, PlanInput, PlannerOptions};
pub use rounding::{round_group, RoundingPolicy};
