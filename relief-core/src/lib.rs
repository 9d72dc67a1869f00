pub mod config;
pub mod coordinator;
pub mod distance;
pub mod events;
pub mod model;
pub mod plan;
pub mod rational;
pub mod store;

pub use config::{load_relief_config, ConfigError, ConfigResult, ReliefConfig};
pub use coordinator::{
    CoordinatorOptions, FlushReport, PlanningCoordinator, RejectedEvent, ReplanTicket,
    SubmitReceipt,
};
pub use distance::{
    CostFunction, CostMatrix, DistanceModel, DistanceService, GeometryError, GreatCircle, Planar,
};
pub use events::{
    DepotRestock, DisasterEvent, EventKind, EventOutcome, EventPayload, IngestOutcome,
    ReconcileError, ReconcileResult, Reconciler, ReconcilerConfig, ZoneOpened, ZoneUpdate,
};
pub use model::{
    AssetType, Depot, Location, Quantities, Severity, Transport, Zone, ZoneAccess, ZoneStatus,
};
pub use plan::{
    AllocationEngine, AllocationPlan, LineItem, PlanError, PlanInput, PlanKpis, PlanResult,
    PlannerOptions, RoundingPolicy,
};
pub use rational::Ratio;
pub use store::{
    load_seed_dir, DurableStore, EntityStore, MemoryDurableStore, SeedData, SqliteEntityStore,
    StoreError, StoreResult, StoreSnapshot,
};
