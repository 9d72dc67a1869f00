use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{add_quantity, Quantities, Zone, ZoneStatus};
use crate::store::{ChangeSet, EntityStore, StoreError};

use super::log::{AppliedEvent, EventDisposition};
use super::models::{DisasterEvent, EventKind, EventPayload, ZoneOpened, ZoneUpdate};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("event {event_id} conflicts with current state: {reason}")]
    Conflict { event_id: String, reason: String },
    #[error("event {event_id} at {timestamp} is older than {watermark}")]
    Stale {
        event_id: String,
        timestamp: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
    #[error("event {event_id} is invalid: {reason}")]
    Validation { event_id: String, reason: String },
    #[error("event {event_id} targets unknown zone {zone_id}")]
    UnknownZone { event_id: String, zone_id: String },
    #[error("event {event_id} targets unknown depot {depot_id}")]
    UnknownDepot { event_id: String, depot_id: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    fn validation(event: &DisasterEvent, reason: impl Into<String>) -> Self {
        ReconcileError::Validation {
            event_id: event.id.clone(),
            reason: reason.into(),
        }
    }

    fn conflict(event: &DisasterEvent, reason: impl Into<String>) -> Self {
        ReconcileError::Conflict {
            event_id: event.id.clone(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable class for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::Stale { .. } => "stale",
            ReconcileError::Validation { .. } => "validation",
            ReconcileError::UnknownZone { .. } => "unknown_zone",
            ReconcileError::UnknownDepot { .. } => "unknown_depot",
            ReconcileError::Store(_) => "store",
        }
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub reorder_window: Duration,
    pub max_clock_skew: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reorder_window: Duration::seconds(5),
            max_clock_skew: Duration::seconds(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Staged,
    Duplicate,
}

/// Result of applying one released event.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EventOutcome {
    pub event_id: String,
    pub kind: Option<EventKind>,
    pub replan: bool,
    #[serde(skip_serializing_if = "Quantities::is_empty")]
    pub released: Quantities,
    #[serde(skip_serializing_if = "Quantities::is_empty")]
    pub clamped: Quantities,
    /// Entities whose cached distances are no longer valid.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalidate: Vec<String>,
    #[serde(skip)]
    pub changes: ChangeSet,
}

/// Stages incoming events in a reorder buffer and applies released events to
/// an [`EntityStore`].
#[derive(Debug, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
    staged: BTreeMap<(DateTime<Utc>, String), DisasterEvent>,
    staged_ids: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            staged: BTreeMap::new(),
            staged_ids: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    pub fn is_staged(&self, event_id: &str) -> bool {
        self.staged_ids.contains(event_id)
    }

    /// Earliest instant at which a staged event becomes releasable.
    pub fn next_release_at(&self) -> Option<DateTime<Utc>> {
        self.staged
            .keys()
            .next()
            .map(|(timestamp, _)| *timestamp + self.config.reorder_window)
    }

    /// Validates and stages an event. Known ids (applied, rejected or staged)
    /// are duplicates and change nothing.
    pub fn ingest(
        &mut self,
        store: &EntityStore,
        event: DisasterEvent,
        now: DateTime<Utc>,
    ) -> ReconcileResult<IngestOutcome> {
        event
            .validate()
            .map_err(|reason| ReconcileError::validation(&event, reason))?;

        if store.events().contains(&event.id) || self.staged_ids.contains(&event.id) {
            debug!(target: "reconciler", event_id = %event.id, "duplicate event ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        if event.timestamp > now + self.config.max_clock_skew {
            return Err(ReconcileError::validation(
                &event,
                format!("timestamp {} is too far in the future", event.timestamp),
            ));
        }

        if let Some(last) = store.events().last_applied_for(event.subject()) {
            if event.timestamp < last {
                return Err(ReconcileError::Stale {
                    event_id: event.id,
                    timestamp: event.timestamp,
                    watermark: last,
                });
            }
        }
        let watermark = now - self.config.reorder_window;
        if event.timestamp < watermark {
            return Err(ReconcileError::Stale {
                event_id: event.id,
                timestamp: event.timestamp,
                watermark,
            });
        }
        if let Some(conflict) = settled_conflict(store, &event) {
            return Err(conflict);
        }

        debug!(
            target: "reconciler",
            event_id = %event.id,
            kind = %event.kind(),
            timestamp = %event.timestamp,
            "event staged"
        );
        self.staged_ids.insert(event.id.clone());
        self.staged.insert((event.timestamp, event.id.clone()), event);
        Ok(IngestOutcome::Staged)
    }

    /// Removes and returns, in timestamp order, every staged event at or
    /// before `now - reorder_window`.
    pub fn ready(&mut self, now: DateTime<Utc>) -> Vec<DisasterEvent> {
        let cutoff = now - self.config.reorder_window;
        let keys: Vec<(DateTime<Utc>, String)> = self
            .staged
            .keys()
            .take_while(|(timestamp, _)| *timestamp <= cutoff)
            .cloned()
            .collect();
        self.take(keys)
    }

    /// Removes every staged event regardless of the window.
    pub fn drain_all(&mut self) -> Vec<DisasterEvent> {
        let keys: Vec<(DateTime<Utc>, String)> = self.staged.keys().cloned().collect();
        self.take(keys)
    }

    fn take(&mut self, keys: Vec<(DateTime<Utc>, String)>) -> Vec<DisasterEvent> {
        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(event) = self.staged.remove(&key) {
                self.staged_ids.remove(&event.id);
                released.push(event);
            }
        }
        released
    }

    /// Puts events back after a failed durable write.
    pub fn restage(&mut self, events: Vec<DisasterEvent>) {
        for event in events {
            self.staged_ids.insert(event.id.clone());
            self.staged.insert((event.timestamp, event.id.clone()), event);
        }
    }

    /// Applies one released event to `store` and records it as applied.
    ///
    /// Callers pass a scratch copy: on error the copy may be partially
    /// modified and must be discarded.
    pub fn apply(
        store: &mut EntityStore,
        event: &DisasterEvent,
    ) -> ReconcileResult<EventOutcome> {
        let mut outcome = EventOutcome {
            event_id: event.id.clone(),
            kind: Some(event.kind()),
            ..EventOutcome::default()
        };

        match &event.payload {
            EventPayload::ZoneOpened(opened) => open_zone(store, event, opened, &mut outcome)?,
            EventPayload::ZoneUpdated(update) => update_zone(store, event, update, &mut outcome)?,
            EventPayload::ZoneResolved { zone_id } => {
                resolve_zone(store, event, zone_id, &mut outcome)?
            }
            EventPayload::DepotRestocked(restock) => {
                let depot_id = &restock.depot_id;
                if store.depot(depot_id).is_none() {
                    return Err(ReconcileError::UnknownDepot {
                        event_id: event.id.clone(),
                        depot_id: depot_id.clone(),
                    });
                }
                ensure_known_types(store, event, &restock.quantities)?;
                for (asset_type, &quantity) in &restock.quantities {
                    let (accepted, clamped, changes) =
                        store.restock(depot_id, asset_type, quantity);
                    outcome.changes.merge(changes);
                    outcome.replan |= accepted > 0;
                    add_quantity(&mut outcome.clamped, asset_type, clamped);
                }
                if !outcome.clamped.is_empty() {
                    warn!(
                        target: "reconciler",
                        event_id = %event.id,
                        depot_id = %depot_id,
                        clamped = ?outcome.clamped,
                        "restock exceeds depot capacity, excess clamped"
                    );
                }
            }
        }

        let changes = store.record_event(AppliedEvent {
            event_id: event.id.clone(),
            kind: event.kind(),
            subject: event.subject().to_string(),
            timestamp: event.timestamp,
            disposition: EventDisposition::Applied,
            note: None,
        });
        outcome.changes.merge(changes);
        store.bump_version();

        info!(
            target: "reconciler",
            event_id = %event.id,
            kind = %event.kind(),
            subject = event.subject(),
            replan = outcome.replan,
            "event applied"
        );
        Ok(outcome)
    }

    /// Records a release-time rejection so the same id is not retried.
    pub fn reject(
        store: &mut EntityStore,
        event: &DisasterEvent,
        error: &ReconcileError,
    ) -> ChangeSet {
        warn!(
            target: "reconciler",
            event_id = %event.id,
            kind = %event.kind(),
            error = %error,
            "event rejected at release"
        );
        let changes = store.record_event(AppliedEvent {
            event_id: event.id.clone(),
            kind: event.kind(),
            subject: event.subject().to_string(),
            timestamp: event.timestamp,
            disposition: EventDisposition::Rejected,
            note: Some(error.to_string()),
        });
        store.bump_version();
        changes
    }
}

/// Conflicts that no later event can clear: zones are never removed and a
/// resolved zone stays resolved.
fn settled_conflict(store: &EntityStore, event: &DisasterEvent) -> Option<ReconcileError> {
    match &event.payload {
        EventPayload::ZoneOpened(opened) => store.zone(&opened.zone_id).map(|existing| {
            ReconcileError::conflict(
                event,
                format!("zone {} already exists ({})", opened.zone_id, existing.status),
            )
        }),
        EventPayload::ZoneUpdated(ZoneUpdate { zone_id, .. })
        | EventPayload::ZoneResolved { zone_id } => store
            .zone(zone_id)
            .filter(|zone| zone.status.terminal())
            .map(|_| ReconcileError::conflict(event, format!("zone {zone_id} is resolved"))),
        EventPayload::DepotRestocked(_) => None,
    }
}

fn ensure_known_types(
    store: &EntityStore,
    event: &DisasterEvent,
    quantities: &Quantities,
) -> ReconcileResult<()> {
    match quantities.keys().find(|asset_type| !store.has_asset_type(asset_type)) {
        Some(unknown) => Err(ReconcileError::validation(
            event,
            format!("unknown asset type {unknown}"),
        )),
        None => Ok(()),
    }
}

fn open_zone(
    store: &mut EntityStore,
    event: &DisasterEvent,
    opened: &ZoneOpened,
    outcome: &mut EventOutcome,
) -> ReconcileResult<()> {
    if let Some(existing) = store.zone(&opened.zone_id) {
        return Err(ReconcileError::conflict(
            event,
            format!("zone {} already exists ({})", opened.zone_id, existing.status),
        ));
    }
    ensure_known_types(store, event, &opened.demand)?;

    let mut zone = Zone::new(opened.zone_id.clone(), opened.location, opened.severity);
    if let Some(name) = &opened.name {
        zone.name = name.clone();
    }
    zone.population = opened.population;
    zone.access = opened.access;
    zone.demand = opened
        .demand
        .iter()
        .filter(|(_, quantity)| **quantity > 0)
        .map(|(asset_type, quantity)| (asset_type.clone(), *quantity))
        .collect();
    outcome.replan = !zone.demand.is_empty();
    outcome.changes.merge(store.insert_zone(zone)?);
    Ok(())
}

fn update_zone(
    store: &mut EntityStore,
    event: &DisasterEvent,
    update: &ZoneUpdate,
    outcome: &mut EventOutcome,
) -> ReconcileResult<()> {
    let zone_id = update.zone_id.as_str();
    match store.zone(zone_id) {
        None => {
            return Err(ReconcileError::UnknownZone {
                event_id: event.id.clone(),
                zone_id: zone_id.to_string(),
            })
        }
        Some(zone) if zone.status.terminal() => {
            return Err(ReconcileError::conflict(
                event,
                format!("zone {zone_id} is resolved"),
            ))
        }
        Some(_) => {}
    }
    ensure_known_types(store, event, &update.demand)?;
    ensure_known_types(store, event, &update.additional_demand)?;
    if let Some(zone) = store.zone(zone_id) {
        for (asset_type, &quantity) in &update.additional_demand {
            let base = update
                .demand
                .get(asset_type)
                .copied()
                .unwrap_or_else(|| zone.demand_of(asset_type));
            if base.checked_add(quantity).is_none() {
                return Err(ReconcileError::validation(
                    event,
                    format!("additional {asset_type} demand overflows the zone total"),
                ));
            }
        }
    }

    let mut excess: Vec<(String, u64)> = Vec::new();
    if let Some(zone) = store.zone_mut(zone_id) {
        if let Some(severity) = update.severity {
            outcome.replan |= zone.severity != severity;
            zone.severity = severity;
        }
        if let Some(access) = update.access {
            if zone.access != access {
                zone.access = access;
                outcome.replan = true;
            }
        }
        if let Some(location) = update.location {
            if zone.location != location {
                zone.location = location;
                outcome.invalidate.push(zone_id.to_string());
                outcome.replan = true;
            }
        }
        for (asset_type, &quantity) in &update.demand {
            if zone.demand_of(asset_type) != quantity {
                outcome.replan = true;
            }
            if quantity == 0 {
                zone.demand.remove(asset_type);
            } else {
                zone.demand.insert(asset_type.clone(), quantity);
            }
        }
        for (asset_type, &quantity) in &update.additional_demand {
            add_quantity(&mut zone.demand, asset_type, quantity);
            outcome.replan |= quantity > 0;
        }
        for (asset_type, &fulfilled) in &zone.fulfilled {
            let demand = zone.demand_of(asset_type);
            if fulfilled > demand {
                excess.push((asset_type.clone(), fulfilled - demand));
            }
        }
    }

    for (asset_type, amount) in excess {
        let (released, changes) = store.release_excess(zone_id, &asset_type, amount);
        outcome.changes.merge(changes);
        add_quantity(&mut outcome.released, &asset_type, released);
    }
    if !outcome.released.is_empty() {
        info!(
            target: "reconciler",
            event_id = %event.id,
            zone_id,
            released = ?outcome.released,
            "lowered demand released excess allocations"
        );
    }
    outcome.changes.zones.insert(zone_id.to_string());
    Ok(())
}

fn resolve_zone(
    store: &mut EntityStore,
    event: &DisasterEvent,
    zone_id: &str,
    outcome: &mut EventOutcome,
) -> ReconcileResult<()> {
    match store.zone(zone_id) {
        None => {
            return Err(ReconcileError::UnknownZone {
                event_id: event.id.clone(),
                zone_id: zone_id.to_string(),
            })
        }
        Some(zone) if zone.status.terminal() => {
            return Err(ReconcileError::conflict(
                event,
                format!("zone {zone_id} is already resolved"),
            ))
        }
        Some(_) => {}
    }

    let (released, changes) = store.release_zone(zone_id);
    outcome.changes.merge(changes);
    outcome
        .changes
        .merge(store.set_zone_status(zone_id, ZoneStatus::Resolved));
    outcome.released = released;
    outcome.invalidate.push(zone_id.to_string());
    outcome.replan = true;
    Ok(())
}
