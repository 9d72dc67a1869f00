use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::events::AppliedEvent;
use crate::model::{AssetType, Depot, Zone};

use super::entity::{AllocationEntry, AllocationKey, SaveBatch, StoreSnapshot};
use super::error::{StoreError, StoreResult};

/// Persistence collaborator behind the entity store. Writes are
/// last-writer-wins per entity id.
pub trait DurableStore: fmt::Debug + Send + Sync {
    fn load_all(&self) -> StoreResult<StoreSnapshot>;
    fn save_all(&self, batch: &SaveBatch) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    version: u64,
    asset_types: BTreeMap<String, AssetType>,
    depots: BTreeMap<String, Depot>,
    zones: BTreeMap<String, Zone>,
    allocations: BTreeMap<AllocationKey, AllocationEntry>,
    events: BTreeMap<String, AppliedEvent>,
}

/// Keeps records in memory. `set_unavailable(true)` makes every call fail,
/// for exercising store-failure paths.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            state.version = snapshot.version;
            state.asset_types = snapshot
                .asset_types
                .into_iter()
                .map(|asset| (asset.id.clone(), asset))
                .collect();
            state.depots = snapshot
                .depots
                .into_iter()
                .map(|depot| (depot.id.clone(), depot))
                .collect();
            state.zones = snapshot
                .zones
                .into_iter()
                .map(|zone| (zone.id.clone(), zone))
                .collect();
            state.allocations = snapshot
                .allocations
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect();
            state.events = snapshot
                .events
                .into_iter()
                .map(|event| (event.event_id.clone(), event))
                .collect();
        }
        store
    }

    pub fn set_unavailable(&self, value: bool) {
        self.unavailable.store(value, Ordering::SeqCst);
    }

    /// Number of successful `save_all` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

impl DurableStore for MemoryDurableStore {
    fn load_all(&self) -> StoreResult<StoreSnapshot> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(StoreSnapshot {
            version: state.version,
            asset_types: state.asset_types.values().cloned().collect(),
            depots: state.depots.values().cloned().collect(),
            zones: state.zones.values().cloned().collect(),
            allocations: state.allocations.values().cloned().collect(),
            events: state.events.values().cloned().collect(),
        })
    }

    fn save_all(&self, batch: &SaveBatch) -> StoreResult<()> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        state.version = batch.version;
        for asset in &batch.asset_types {
            state.asset_types.insert(asset.id.clone(), asset.clone());
        }
        for depot in &batch.depots {
            state.depots.insert(depot.id.clone(), depot.clone());
        }
        for zone in &batch.zones {
            state.zones.insert(zone.id.clone(), zone.clone());
        }
        for entry in &batch.allocations {
            state.allocations.insert(entry.key(), entry.clone());
        }
        for key in &batch.removed_allocations {
            state.allocations.remove(key);
        }
        for event in &batch.events {
            state.events.insert(event.event_id.clone(), event.clone());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
