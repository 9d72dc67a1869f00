pub mod log;
pub mod models;
pub mod reconciler;

pub use log::{AppliedEvent, EventDisposition, EventLog};
pub use models::{
    DepotRestock, DisasterEvent, EventKind, EventPayload, ZoneOpened, ZoneUpdate,
};
pub use reconciler::{
    EventOutcome, IngestOutcome, ReconcileError, ReconcileResult, Reconciler, ReconcilerConfig,
};
