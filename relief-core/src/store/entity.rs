use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{AppliedEvent, EventLog};
use crate::model::{
    add_quantity, sub_quantity, AssetType, AssetTypeId, Depot, DepotId, Quantities, Zone,
    ZoneId, ZoneStatus,
};
use crate::plan::{AllocationPlan, PlanError, PlanResult};

use super::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    pub zone_id: ZoneId,
    pub depot_id: DepotId,
    pub asset_type: AssetTypeId,
}

impl AllocationKey {
    pub fn new(
        zone_id: impl Into<String>,
        depot_id: impl Into<String>,
        asset_type: impl Into<String>,
    ) -> Self {
        Self {
            zone_id: zone_id.into(),
            depot_id: depot_id.into(),
            asset_type: asset_type.into(),
        }
    }
}

/// One ledger row: how much of a type a depot has committed to a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub zone_id: ZoneId,
    pub depot_id: DepotId,
    pub asset_type: AssetTypeId,
    pub quantity: u64,
    pub unit_cost: f64,
}

impl AllocationEntry {
    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(&self.zone_id, &self.depot_id, &self.asset_type)
    }
}

/// Ids touched by a mutation, used to build the durable write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub asset_types: BTreeSet<AssetTypeId>,
    pub depots: BTreeSet<DepotId>,
    pub zones: BTreeSet<ZoneId>,
    pub allocations: BTreeSet<AllocationKey>,
    pub events: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.asset_types.is_empty()
            && self.depots.is_empty()
            && self.zones.is_empty()
            && self.allocations.is_empty()
            && self.events.is_empty()
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.asset_types.extend(other.asset_types);
        self.depots.extend(other.depots);
        self.zones.extend(other.zones);
        self.allocations.extend(other.allocations);
        self.events.extend(other.events);
    }
}

/// Materialized records for one durable write. Allocation keys that no
/// longer exist in the store end up in `removed_allocations`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveBatch {
    pub version: u64,
    pub asset_types: Vec<AssetType>,
    pub depots: Vec<Depot>,
    pub zones: Vec<Zone>,
    pub allocations: Vec<AllocationEntry>,
    pub removed_allocations: Vec<AllocationKey>,
    pub events: Vec<AppliedEvent>,
}

impl SaveBatch {
    pub fn is_empty(&self) -> bool {
        self.asset_types.is_empty()
            && self.depots.is_empty()
            && self.zones.is_empty()
            && self.allocations.is_empty()
            && self.removed_allocations.is_empty()
            && self.events.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u64,
    pub asset_types: Vec<AssetType>,
    pub depots: Vec<Depot>,
    pub zones: Vec<Zone>,
    pub allocations: Vec<AllocationEntry>,
    #[serde(default)]
    pub events: Vec<AppliedEvent>,
}

/// What a planning pass reads: depots plus active zones at one version.
#[derive(Debug, Clone)]
pub struct PlanningView {
    pub version: u64,
    pub depots: Vec<Depot>,
    pub zones: Vec<Zone>,
}

/// In-memory authoritative state. Callers mutate a clone and swap it in once
/// the durable write succeeded.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    version: u64,
    asset_types: BTreeMap<AssetTypeId, AssetType>,
    depots: BTreeMap<DepotId, Depot>,
    zones: BTreeMap<ZoneId, Zone>,
    allocations: BTreeMap<AllocationKey, AllocationEntry>,
    events: EventLog,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> StoreResult<Self> {
        let store = Self {
            version: snapshot.version,
            asset_types: snapshot
                .asset_types
                .into_iter()
                .map(|asset| (asset.id.clone(), asset))
                .collect(),
            depots: snapshot
                .depots
                .into_iter()
                .map(|depot| (depot.id.clone(), depot))
                .collect(),
            zones: snapshot
                .zones
                .into_iter()
                .map(|zone| (zone.id.clone(), zone))
                .collect(),
            allocations: snapshot
                .allocations
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect(),
            events: EventLog::from_entries(snapshot.events),
        };
        store.check_invariants()?;
        Ok(store)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: self.version,
            asset_types: self.asset_types.values().cloned().collect(),
            depots: self.depots.values().cloned().collect(),
            zones: self.zones.values().cloned().collect(),
            allocations: self.allocations.values().cloned().collect(),
            events: self.events.iter().cloned().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn asset_types(&self) -> impl Iterator<Item = &AssetType> {
        self.asset_types.values()
    }

    pub fn has_asset_type(&self, asset_type: &str) -> bool {
        self.asset_types.contains_key(asset_type)
    }

    pub fn depots(&self) -> impl Iterator<Item = &Depot> {
        self.depots.values()
    }

    pub fn depot(&self, depot_id: &str) -> Option<&Depot> {
        self.depots.get(depot_id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id)
    }

    pub(crate) fn zone_mut(&mut self, zone_id: &str) -> Option<&mut Zone> {
        self.zones.get_mut(zone_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &AllocationEntry> {
        self.allocations.values()
    }

    pub fn allocations_for_zone<'a>(
        &'a self,
        zone_id: &'a str,
    ) -> impl Iterator<Item = &'a AllocationEntry> + 'a {
        self.allocations
            .values()
            .filter(move |entry| entry.zone_id == zone_id)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn planning_view(&self) -> PlanningView {
        PlanningView {
            version: self.version,
            depots: self.depots.values().cloned().collect(),
            zones: self
                .zones
                .values()
                .filter(|zone| zone.is_active())
                .cloned()
                .collect(),
        }
    }

    /// Units of `asset_type` drawn from `depot_id` and still held by zones.
    pub fn outstanding_from(&self, depot_id: &str, asset_type: &str) -> u64 {
        self.allocations
            .values()
            .filter(|entry| entry.depot_id == depot_id && entry.asset_type == asset_type)
            .map(|entry| entry.quantity)
            .fold(0u64, u64::saturating_add)
    }

    pub fn upsert_asset_type(&mut self, asset_type: AssetType) -> ChangeSet {
        let mut changes = ChangeSet::default();
        changes.asset_types.insert(asset_type.id.clone());
        self.asset_types.insert(asset_type.id.clone(), asset_type);
        changes
    }

    pub fn upsert_depot(&mut self, depot: Depot) -> StoreResult<ChangeSet> {
        self.ensure_known(depot.capacity.keys().chain(depot.inventory.keys()), &depot.id)?;
        for (asset_type, &inventory) in &depot.inventory {
            let outstanding = self.outstanding_from(&depot.id, asset_type);
            if inventory + outstanding > depot.capacity_of(asset_type) {
                return Err(StoreError::Invariant(format!(
                    "depot {} would hold {} {} plus {} outstanding over capacity {}",
                    depot.id,
                    inventory,
                    asset_type,
                    outstanding,
                    depot.capacity_of(asset_type)
                )));
            }
        }
        let mut changes = ChangeSet::default();
        changes.depots.insert(depot.id.clone());
        self.depots.insert(depot.id.clone(), depot);
        Ok(changes)
    }

    pub fn insert_zone(&mut self, zone: Zone) -> StoreResult<ChangeSet> {
        self.ensure_known(zone.demand.keys(), &zone.id)?;
        if !zone.fulfilled.is_empty() {
            return Err(StoreError::Invariant(format!(
                "zone {} inserted with fulfilled quantities",
                zone.id
            )));
        }
        let mut changes = ChangeSet::default();
        changes.zones.insert(zone.id.clone());
        self.zones.insert(zone.id.clone(), zone);
        Ok(changes)
    }

    fn ensure_known<'a>(
        &self,
        mut asset_types: impl Iterator<Item = &'a AssetTypeId>,
        owner: &str,
    ) -> StoreResult<()> {
        match asset_types.find(|asset_type| !self.has_asset_type(asset_type)) {
            Some(unknown) => Err(StoreError::Invariant(format!(
                "{owner} references unknown asset type {unknown}"
            ))),
            None => Ok(()),
        }
    }

    /// Moves plan quantities from depot inventory into zone fulfillment.
    ///
    /// The whole plan is validated before anything changes.
    pub fn apply_plan(&mut self, plan: &AllocationPlan) -> PlanResult<ChangeSet> {
        if plan.snapshot_version != self.version {
            return Err(PlanError::StaleSnapshot {
                planned: plan.snapshot_version,
                current: self.version,
            });
        }

        let mut per_depot: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        let mut per_zone: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for item in &plan.line_items {
            if !self.has_asset_type(&item.asset_type) {
                return Err(PlanError::inconsistent(
                    &plan.plan_id,
                    format!("unknown asset type {}", item.asset_type),
                ));
            }
            if !self.depots.contains_key(&item.depot_id) {
                return Err(PlanError::inconsistent(
                    &plan.plan_id,
                    format!("unknown depot {}", item.depot_id),
                ));
            }
            match self.zones.get(&item.zone_id) {
                Some(zone) if zone.is_active() => {}
                Some(_) => {
                    return Err(PlanError::inconsistent(
                        &plan.plan_id,
                        format!("zone {} is resolved", item.zone_id),
                    ))
                }
                None => {
                    return Err(PlanError::inconsistent(
                        &plan.plan_id,
                        format!("unknown zone {}", item.zone_id),
                    ))
                }
            }
            let drawn = per_depot
                .entry((item.depot_id.as_str(), item.asset_type.as_str()))
                .or_insert(0);
            *drawn = drawn.saturating_add(item.quantity);
            let sent = per_zone
                .entry((item.zone_id.as_str(), item.asset_type.as_str()))
                .or_insert(0);
            *sent = sent.saturating_add(item.quantity);
        }

        for (&(depot_id, asset_type), &quantity) in &per_depot {
            let inventory = self
                .depots
                .get(depot_id)
                .map_or(0, |depot| depot.inventory_of(asset_type));
            if quantity > inventory {
                return Err(PlanError::inconsistent(
                    &plan.plan_id,
                    format!("depot {depot_id} holds {inventory} {asset_type}, plan draws {quantity}"),
                ));
            }
        }
        for (&(zone_id, asset_type), &quantity) in &per_zone {
            let open = self
                .zones
                .get(zone_id)
                .map_or(0, |zone| zone.unfulfilled(asset_type));
            if quantity > open {
                return Err(PlanError::inconsistent(
                    &plan.plan_id,
                    format!("zone {zone_id} needs {open} {asset_type}, plan sends {quantity}"),
                ));
            }
        }

        let mut changes = ChangeSet::default();
        if plan.line_items.is_empty() {
            return Ok(changes);
        }

        for item in &plan.line_items {
            if let Some(depot) = self.depots.get_mut(&item.depot_id) {
                sub_quantity(&mut depot.inventory, &item.asset_type, item.quantity);
            }
            if let Some(zone) = self.zones.get_mut(&item.zone_id) {
                add_quantity(&mut zone.fulfilled, &item.asset_type, item.quantity);
            }
            let key = AllocationKey::new(&item.zone_id, &item.depot_id, &item.asset_type);
            let entry = self
                .allocations
                .entry(key.clone())
                .or_insert_with(|| AllocationEntry {
                    zone_id: item.zone_id.clone(),
                    depot_id: item.depot_id.clone(),
                    asset_type: item.asset_type.clone(),
                    quantity: 0,
                    unit_cost: item.unit_cost,
                });
            entry.quantity += item.quantity;
            entry.unit_cost = item.unit_cost;

            changes.depots.insert(item.depot_id.clone());
            changes.zones.insert(item.zone_id.clone());
            changes.allocations.insert(key);
        }
        self.bump_version();
        info!(
            target: "store",
            plan_id = %plan.plan_id,
            version = self.version,
            line_items = plan.line_items.len(),
            "plan applied"
        );
        Ok(changes)
    }

    /// Returns every allocation of the zone to its depots and clears its
    /// fulfillment. Returns the released quantities per type.
    pub fn release_zone(&mut self, zone_id: &str) -> (Quantities, ChangeSet) {
        let mut released = Quantities::new();
        let mut changes = ChangeSet::default();
        let keys: Vec<AllocationKey> = self
            .allocations
            .keys()
            .filter(|key| key.zone_id == zone_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = self.allocations.remove(&key) {
                if let Some(depot) = self.depots.get_mut(&entry.depot_id) {
                    add_quantity(&mut depot.inventory, &entry.asset_type, entry.quantity);
                }
                add_quantity(&mut released, &entry.asset_type, entry.quantity);
                changes.depots.insert(entry.depot_id.clone());
                changes.allocations.insert(key);
            }
        }
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.fulfilled.clear();
            changes.zones.insert(zone_id.to_string());
        }
        debug!(target: "store", zone_id, released = ?released, "zone allocations released");
        (released, changes)
    }

    /// Gives back `amount` units of a zone's fulfillment, most expensive
    /// allocation first, ties by descending depot id. Returns what was released.
    pub fn release_excess(
        &mut self,
        zone_id: &str,
        asset_type: &str,
        amount: u64,
    ) -> (u64, ChangeSet) {
        let mut changes = ChangeSet::default();
        let mut entries: Vec<(AllocationKey, f64)> = self
            .allocations
            .values()
            .filter(|entry| entry.zone_id == zone_id && entry.asset_type == asset_type)
            .map(|entry| (entry.key(), entry.unit_cost))
            .collect();
        entries.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.depot_id.cmp(&a.0.depot_id))
        });

        let mut remaining = amount;
        for (key, _) in entries {
            if remaining == 0 {
                break;
            }
            let Some(entry) = self.allocations.get_mut(&key) else {
                continue;
            };
            let take = entry.quantity.min(remaining);
            entry.quantity -= take;
            remaining -= take;
            if entry.quantity == 0 {
                self.allocations.remove(&key);
            }
            if let Some(depot) = self.depots.get_mut(&key.depot_id) {
                add_quantity(&mut depot.inventory, asset_type, take);
            }
            changes.depots.insert(key.depot_id.clone());
            changes.allocations.insert(key);
        }

        let released = amount - remaining;
        if released > 0 {
            if let Some(zone) = self.zones.get_mut(zone_id) {
                sub_quantity(&mut zone.fulfilled, asset_type, released);
            }
            changes.zones.insert(zone_id.to_string());
        }
        (released, changes)
    }

    /// Raises inventory up to `capacity - outstanding`. Returns
    /// `(accepted, clamped)`; unknown depots accept nothing.
    pub fn restock(
        &mut self,
        depot_id: &str,
        asset_type: &str,
        quantity: u64,
    ) -> (u64, u64, ChangeSet) {
        let mut changes = ChangeSet::default();
        let outstanding = self.outstanding_from(depot_id, asset_type);
        let Some(depot) = self.depots.get_mut(depot_id) else {
            return (0, quantity, changes);
        };
        let room = depot
            .capacity_of(asset_type)
            .saturating_sub(depot.inventory_of(asset_type))
            .saturating_sub(outstanding);
        let accepted = quantity.min(room);
        add_quantity(&mut depot.inventory, asset_type, accepted);
        if accepted > 0 {
            changes.depots.insert(depot_id.to_string());
        }
        (accepted, quantity - accepted, changes)
    }

    pub fn set_zone_status(&mut self, zone_id: &str, status: ZoneStatus) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if let Some(zone) = self.zones.get_mut(zone_id) {
            zone.status = status;
            changes.zones.insert(zone_id.to_string());
        }
        changes
    }

    pub fn record_event(&mut self, entry: AppliedEvent) -> ChangeSet {
        let mut changes = ChangeSet::default();
        changes.events.insert(entry.event_id.clone());
        self.events.record(entry);
        changes
    }

    pub fn batch_for(&self, changes: &ChangeSet) -> SaveBatch {
        let mut batch = SaveBatch {
            version: self.version,
            ..SaveBatch::default()
        };
        batch.asset_types = changes
            .asset_types
            .iter()
            .filter_map(|id| self.asset_types.get(id).cloned())
            .collect();
        batch.depots = changes
            .depots
            .iter()
            .filter_map(|id| self.depots.get(id).cloned())
            .collect();
        batch.zones = changes
            .zones
            .iter()
            .filter_map(|id| self.zones.get(id).cloned())
            .collect();
        for key in &changes.allocations {
            match self.allocations.get(key) {
                Some(entry) => batch.allocations.push(entry.clone()),
                None => batch.removed_allocations.push(key.clone()),
            }
        }
        batch.events = changes
            .events
            .iter()
            .filter_map(|id| self.events.get(id).cloned())
            .collect();
        batch
    }

    pub fn check_invariants(&self) -> StoreResult<()> {
        let mut drawn: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        let mut held: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for entry in self.allocations.values() {
            if !self.depots.contains_key(&entry.depot_id) {
                return Err(StoreError::Invariant(format!(
                    "allocation references unknown depot {}",
                    entry.depot_id
                )));
            }
            *drawn
                .entry((entry.depot_id.as_str(), entry.asset_type.as_str()))
                .or_insert(0) += entry.quantity;
            *held
                .entry((entry.zone_id.as_str(), entry.asset_type.as_str()))
                .or_insert(0) += entry.quantity;
        }

        for depot in self.depots.values() {
            let types: BTreeSet<&AssetTypeId> =
                depot.capacity.keys().chain(depot.inventory.keys()).collect();
            for asset_type in types {
                let outstanding = drawn
                    .get(&(depot.id.as_str(), asset_type.as_str()))
                    .copied()
                    .unwrap_or(0);
                if depot.inventory_of(asset_type) + outstanding > depot.capacity_of(asset_type) {
                    return Err(StoreError::Invariant(format!(
                        "depot {} over capacity for {}",
                        depot.id, asset_type
                    )));
                }
            }
        }

        for zone in self.zones.values() {
            if zone.status == ZoneStatus::Resolved && !zone.fulfilled.is_empty() {
                return Err(StoreError::Invariant(format!(
                    "resolved zone {} still holds assets",
                    zone.id
                )));
            }
            for (asset_type, &fulfilled) in &zone.fulfilled {
                if fulfilled > zone.demand_of(asset_type) {
                    return Err(StoreError::Invariant(format!(
                        "zone {} fulfilled {} {} above demand {}",
                        zone.id,
                        fulfilled,
                        asset_type,
                        zone.demand_of(asset_type)
                    )));
                }
            }
            for (asset_type, &fulfilled) in &zone.fulfilled {
                let ledger = held
                    .get(&(zone.id.as_str(), asset_type.as_str()))
                    .copied()
                    .unwrap_or(0);
                if ledger != fulfilled {
                    return Err(StoreError::Invariant(format!(
                        "zone {} fulfilled {} {} but ledger holds {}",
                        zone.id, fulfilled, asset_type, ledger
                    )));
                }
            }
        }

        for (&(zone_id, asset_type), &quantity) in &held {
            let Some(zone) = self.zones.get(zone_id) else {
                return Err(StoreError::Invariant(format!(
                    "allocation references unknown zone {zone_id}"
                )));
            };
            if zone.fulfilled_of(asset_type) != quantity {
                return Err(StoreError::Invariant(format!(
                    "ledger holds {quantity} {asset_type} for zone {zone_id}, zone records {}",
                    zone.fulfilled_of(asset_type)
                )));
            }
        }
        Ok(())
    }
}
