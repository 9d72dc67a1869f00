pub mod durable;
pub mod entity;
pub mod error;
pub mod seed;
pub mod sqlite;

pub use durable::{DurableStore, MemoryDurableStore};
pub use entity::{
    AllocationEntry, AllocationKey, ChangeSet, EntityStore, PlanningView, SaveBatch,
    StoreSnapshot,
};
pub use error::{StoreError, StoreResult};
pub use seed::{load_seed_dir, SeedData};
pub use sqlite::{SqliteEntityStore, SqliteEntityStoreBuilder};
