use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReliefConfig;
use crate::distance::{CostFunction, DistanceService, GreatCircle};
use crate::events::{
    DisasterEvent, EventOutcome, IngestOutcome, ReconcileError, ReconcileResult, Reconciler,
    ReconcilerConfig,
};
use crate::plan::{
    AllocationEngine, AllocationPlan, PlanError, PlanInput, PlanResult, PlannerOptions,
};
use crate::store::{ChangeSet, DurableStore, EntityStore, SeedData, StoreResult, StoreSnapshot};

/// Upper bound on back-to-back passes a single caller runs while draining
/// coalesced requests.
const MAX_COALESCED_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub planner: PlannerOptions,
    pub reconciler: ReconcilerConfig,
    pub cost_function: Arc<dyn CostFunction>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            planner: PlannerOptions::default(),
            reconciler: ReconcilerConfig::default(),
            cost_function: Arc::new(GreatCircle::default()),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &ReliefConfig) -> Self {
        Self {
            planner: config.planner_options(),
            reconciler: config.reconciler_config(),
            cost_function: config.cost_function(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplanTicket {
    /// This caller ran the passes; `plan` is the last one applied.
    Completed {
        plan: Option<AllocationPlan>,
        passes: usize,
    },
    /// Another pass was running; it will pick up the latest state.
    Scheduled,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmitReceipt {
    pub event_id: String,
    pub status: IngestOutcome,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RejectedEvent {
    pub event_id: String,
    pub code: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FlushReport {
    pub applied: Vec<EventOutcome>,
    pub rejected: Vec<RejectedEvent>,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replan: Option<ReplanTicket>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Default)]
struct Gate {
    running: bool,
    pending: bool,
}

/// Serializes writers to the entity store and runs at most one planning pass
/// at a time.
///
/// Lock order: `store` before `reconciler`. Planning reads a snapshot and
/// computes outside every lock; only the final apply takes the write lock.
#[derive(Debug)]
pub struct PlanningCoordinator {
    store: RwLock<EntityStore>,
    reconciler: Mutex<Reconciler>,
    distances: Mutex<DistanceService>,
    engine: AllocationEngine,
    durable: Arc<dyn DurableStore>,
    latest: RwLock<Option<AllocationPlan>>,
    gate: Mutex<Gate>,
}

impl PlanningCoordinator {
    /// Loads state from the durable store.
    pub fn open(
        durable: Arc<dyn DurableStore>,
        options: CoordinatorOptions,
    ) -> StoreResult<Self> {
        let snapshot = durable.load_all()?;
        let store = EntityStore::from_snapshot(snapshot)?;
        info!(
            target: "coordinator",
            version = store.version(),
            depots = store.depots().count(),
            zones = store.zones().count(),
            "coordinator opened"
        );
        Ok(Self {
            store: RwLock::new(store),
            reconciler: Mutex::new(Reconciler::new(options.reconciler)),
            distances: Mutex::new(DistanceService::new(options.cost_function)),
            engine: AllocationEngine::new(options.planner),
            durable,
            latest: RwLock::new(None),
            gate: Mutex::new(Gate::default()),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.read().snapshot()
    }

    pub fn latest_plan(&self) -> Option<AllocationPlan> {
        self.latest.read().clone()
    }

    pub fn pending_events(&self) -> usize {
        self.reconciler.lock().pending()
    }

    pub fn is_planning(&self) -> bool {
        self.gate.lock().running
    }

    /// Loads reference data and persists it.
    pub fn seed(&self, seed: SeedData) -> StoreResult<ChangeSet> {
        let mut guard = self.store.write();
        let mut working = guard.clone();
        let changes = seed.apply_to(&mut working)?;
        working.check_invariants()?;
        if changes.is_empty() {
            return Ok(changes);
        }
        self.durable.save_all(&working.batch_for(&changes))?;
        for depot_id in &changes.depots {
            self.distances.lock().invalidate(depot_id);
        }
        *guard = working;
        info!(target: "coordinator", version = guard.version(), "seed data applied");
        Ok(changes)
    }

    /// Validates and stages an event. Nothing is applied until the event
    /// leaves the reorder window and a flush runs.
    pub fn submit(
        &self,
        event: DisasterEvent,
        now: DateTime<Utc>,
    ) -> ReconcileResult<SubmitReceipt> {
        let event_id = event.id.clone();
        let store = self.store.read();
        let mut reconciler = self.reconciler.lock();
        let status = reconciler.ingest(&store, event, now)?;
        Ok(SubmitReceipt {
            event_id,
            status,
            pending: reconciler.pending(),
        })
    }

    /// Applies staged events that have left the reorder window, then runs a
    /// re-plan when any of them asked for one.
    pub fn flush(&self, now: DateTime<Utc>) -> ReconcileResult<FlushReport> {
        let ready = self.reconciler.lock().ready(now);
        self.apply_events(ready, now)
    }

    /// Applies every staged event regardless of the window.
    pub fn drain(&self, now: DateTime<Utc>) -> ReconcileResult<FlushReport> {
        let staged = self.reconciler.lock().drain_all();
        self.apply_events(staged, now)
    }

    fn apply_events(
        &self,
        events: Vec<DisasterEvent>,
        now: DateTime<Utc>,
    ) -> ReconcileResult<FlushReport> {
        let mut report = FlushReport::default();
        if events.is_empty() {
            report.pending = self.pending_events();
            return Ok(report);
        }

        let mut invalidate = Vec::new();
        {
            let mut guard = self.store.write();
            let mut working = guard.clone();
            let mut changes = ChangeSet::default();

            for event in &events {
                if working.events().contains(&event.id) {
                    debug!(target: "coordinator", event_id = %event.id, "already recorded, skipped");
                    continue;
                }
                let mut scratch = working.clone();
                match Reconciler::apply(&mut scratch, event) {
                    Ok(outcome) => {
                        working = scratch;
                        changes.merge(outcome.changes.clone());
                        invalidate.extend(outcome.invalidate.iter().cloned());
                        report.applied.push(outcome);
                    }
                    Err(err) => {
                        changes.merge(Reconciler::reject(&mut working, event, &err));
                        report.rejected.push(RejectedEvent {
                            event_id: event.id.clone(),
                            code: err.code(),
                            reason: err.to_string(),
                        });
                    }
                }
            }

            if let Err(err) = working
                .check_invariants()
                .and_then(|_| self.durable.save_all(&working.batch_for(&changes)))
            {
                error!(
                    target: "coordinator",
                    error = %err,
                    events = events.len(),
                    "event batch not persisted, restaging"
                );
                drop(guard);
                self.reconciler.lock().restage(events);
                return Err(ReconcileError::Store(err));
            }
            *guard = working;
        }

        {
            let mut distances = self.distances.lock();
            for entity_id in &invalidate {
                distances.invalidate(entity_id);
            }
        }

        report.pending = self.pending_events();
        if report.applied.iter().any(|outcome| outcome.replan) {
            match self.request_replan(now) {
                Ok(ticket) => report.replan = Some(ticket),
                Err(err) => warn!(target: "coordinator", error = %err, "re-plan after flush failed"),
            }
        }
        info!(
            target: "coordinator",
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            pending = report.pending,
            "events flushed"
        );
        Ok(report)
    }

    /// Runs planning passes until no request is outstanding, or returns
    /// [`ReplanTicket::Scheduled`] at once if another caller holds the slot.
    pub fn request_replan(&self, now: DateTime<Utc>) -> PlanResult<ReplanTicket> {
        {
            let mut gate = self.gate.lock();
            if gate.running {
                gate.pending = true;
                debug!(target: "coordinator", "planning in progress, request coalesced");
                return Ok(ReplanTicket::Scheduled);
            }
            gate.running = true;
            gate.pending = false;
        }

        let mut passes = 0;
        let mut last = None;
        loop {
            passes += 1;
            match self.plan_pass(now) {
                Ok(plan) => last = Some(plan),
                Err(PlanError::StaleSnapshot { planned, current }) => {
                    debug!(
                        target: "coordinator",
                        planned,
                        current,
                        "plan superseded, running again"
                    );
                    self.gate.lock().pending = true;
                }
                Err(err) => {
                    let mut gate = self.gate.lock();
                    gate.running = false;
                    gate.pending = false;
                    return Err(err);
                }
            }

            let mut gate = self.gate.lock();
            if !gate.pending || passes >= MAX_COALESCED_PASSES {
                if gate.pending {
                    warn!(target: "coordinator", passes, "pass limit reached with requests pending");
                }
                gate.running = false;
                gate.pending = false;
                break;
            }
            gate.pending = false;
        }

        Ok(ReplanTicket::Completed { plan: last, passes })
    }

    /// Computes a plan from the current state without applying it.
    pub fn preview(&self, now: DateTime<Utc>) -> AllocationPlan {
        self.compute(now)
    }

    fn compute(&self, now: DateTime<Utc>) -> AllocationPlan {
        let view = self.store.read().planning_view();
        let costs = self.distances.lock().matrix(&view.depots, &view.zones);
        self.engine.plan(&PlanInput {
            plan_id: format!("plan-{}", Uuid::new_v4().simple()),
            generated_at: now,
            snapshot_version: view.version,
            depots: &view.depots,
            zones: &view.zones,
            costs: &costs,
        })
    }

    fn plan_pass(&self, now: DateTime<Utc>) -> PlanResult<AllocationPlan> {
        let plan = self.compute(now);
        self.apply_plan(&plan)?;
        *self.latest.write() = Some(plan.clone());
        Ok(plan)
    }

    /// Applies `plan` if the store is still at the version it was computed
    /// against. Readers see either the old or the new state.
    pub fn apply_plan(&self, plan: &AllocationPlan) -> PlanResult<()> {
        let mut guard = self.store.write();
        if guard.version() != plan.snapshot_version {
            return Err(PlanError::StaleSnapshot {
                planned: plan.snapshot_version,
                current: guard.version(),
            });
        }
        if plan.is_empty() {
            return Ok(());
        }
        let mut working = guard.clone();
        let changes = working.apply_plan(plan)?;
        working.check_invariants()?;
        self.durable
            .save_all(&working.batch_for(&changes))
            .map_err(|err| {
                error!(
                    target: "coordinator",
                    plan_id = %plan.plan_id,
                    error = %err,
                    "plan not persisted"
                );
                PlanError::Store(err)
            })?;
        *guard = working;
        Ok(())
    }

    /// Flushes released events on a fixed interval until the task is dropped.
    pub async fn run_flush_loop(self: Arc<Self>, interval: Duration) {
        loop {
            sleep(interval).await;
            let coordinator = Arc::clone(&self);
            let result =
                tokio::task::spawn_blocking(move || coordinator.flush(Utc::now())).await;
            match result {
                Ok(Ok(report)) if !report.is_empty() => {
                    debug!(
                        target: "coordinator",
                        applied = report.applied.len(),
                        rejected = report.rejected.len(),
                        "background flush"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(target: "coordinator", error = %err, "background flush failed"),
                Err(err) => error!(target: "coordinator", error = %err, "flush task panicked"),
            }
        }
    }
}
