use chrono::{DateTime, Duration, TimeZone, Utc};
use relief_core::events::EventDisposition;
use relief_core::{
    AllocationPlan, AssetType, Depot, DepotRestock, DisasterEvent, EntityStore, EventPayload,
    IngestOutcome, LineItem, Location, PlanKpis, Quantities, ReconcileError, Reconciler,
    ReconcilerConfig, Severity, Zone, ZoneAccess, ZoneOpened, ZoneStatus, ZoneUpdate,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn reconciler(window_secs: i64) -> Reconciler {
    Reconciler::new(ReconcilerConfig {
        reorder_window: Duration::seconds(window_secs),
        max_clock_skew: Duration::seconds(60),
    })
}

fn base_store() -> EntityStore {
    let mut store = EntityStore::new();
    store.upsert_asset_type(AssetType::new("water", "liter"));
    store
        .upsert_depot(Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 100, 100))
        .unwrap();
    store
        .upsert_depot(Depot::new("B", Location::new(0.0, 2.0)).with_stock("water", 120, 100))
        .unwrap();
    store
        .insert_zone(
            Zone::new("z1", Location::new(0.0, 1.0), Severity::High).with_demand("water", 50),
        )
        .unwrap();
    store
}

fn quantities(entries: &[(&str, u64)]) -> Quantities {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), *value))
        .collect()
}

/// Commits a hand-written plan so zones hold allocations.
fn commit(store: &mut EntityStore, items: &[(&str, &str, u64, f64)]) {
    let plan = AllocationPlan {
        plan_id: "manual".to_string(),
        generated_at: t0(),
        snapshot_version: store.version(),
        line_items: items
            .iter()
            .map(|(depot_id, zone_id, quantity, unit_cost)| LineItem {
                depot_id: depot_id.to_string(),
                zone_id: zone_id.to_string(),
                asset_type: "water".to_string(),
                quantity: *quantity,
                unit_cost: *unit_cost,
            })
            .collect(),
        total_cost: 0.0,
        shortfall: Default::default(),
        kpis: PlanKpis::default(),
        rationales: Vec::new(),
    };
    store.apply_plan(&plan).unwrap();
}

fn opened(id: &str, ts: DateTime<Utc>, zone_id: &str, water: u64) -> DisasterEvent {
    DisasterEvent::new(
        id,
        ts,
        EventPayload::ZoneOpened(ZoneOpened {
            zone_id: zone_id.to_string(),
            name: None,
            location: Location::new(1.0, 1.0),
            severity: Severity::Medium,
            population: 0,
            demand: quantities(&[("water", water)]),
            access: ZoneAccess::RoadOpen,
        }),
    )
}

fn updated(id: &str, ts: DateTime<Utc>, update: ZoneUpdate) -> DisasterEvent {
    DisasterEvent::new(id, ts, EventPayload::ZoneUpdated(update))
}

fn resolved(id: &str, ts: DateTime<Utc>, zone_id: &str) -> DisasterEvent {
    DisasterEvent::new(
        id,
        ts,
        EventPayload::ZoneResolved {
            zone_id: zone_id.to_string(),
        },
    )
}

fn release_all(reconciler: &mut Reconciler, store: &mut EntityStore, now: DateTime<Utc>) {
    for event in reconciler.ready(now) {
        let mut scratch = store.clone();
        match Reconciler::apply(&mut scratch, &event) {
            Ok(_) => *store = scratch,
            Err(err) => {
                Reconciler::reject(store, &event, &err);
            }
        }
    }
}

#[test]
fn replayed_event_is_a_no_op() {
    let mut store = base_store();
    let mut reconciler = reconciler(0);
    let event = opened("evt-1", t0(), "z2", 30);

    assert_eq!(
        reconciler.ingest(&store, event.clone(), t0()).unwrap(),
        IngestOutcome::Staged
    );
    assert_eq!(
        reconciler.ingest(&store, event.clone(), t0()).unwrap(),
        IngestOutcome::Duplicate
    );
    release_all(&mut reconciler, &mut store, t0());
    let after_first = store.snapshot();

    assert_eq!(
        reconciler.ingest(&store, event, t0()).unwrap(),
        IngestOutcome::Duplicate
    );
    release_all(&mut reconciler, &mut store, t0());
    assert_eq!(store.snapshot(), after_first);
    assert_eq!(store.zone("z2").unwrap().demand_of("water"), 30);
}

#[test]
fn reorder_window_releases_in_timestamp_order() {
    let mut store = base_store();
    let mut reconciler = reconciler(10);
    let now = t0();

    // The update is submitted first but happened after the opening.
    let update = updated(
        "evt-update",
        now - Duration::seconds(2),
        ZoneUpdate {
            zone_id: "z9".into(),
            additional_demand: quantities(&[("water", 5)]),
            ..ZoneUpdate::default()
        },
    );
    let open = opened("evt-open", now - Duration::seconds(4), "z9", 20);
    reconciler.ingest(&store, update, now).unwrap();
    reconciler.ingest(&store, open, now).unwrap();

    assert!(reconciler.ready(now).is_empty());
    assert_eq!(reconciler.pending(), 2);

    let released = reconciler.ready(now + Duration::seconds(10));
    let ids: Vec<&str> = released.iter().map(|event| event.id.as_str()).collect();
    assert_eq!(ids, vec!["evt-open", "evt-update"]);

    for event in &released {
        Reconciler::apply(&mut store, event).unwrap();
    }
    assert_eq!(store.zone("z9").unwrap().demand_of("water"), 25);
}

#[test]
fn late_and_future_events_are_rejected_at_ingest() {
    let mut store = base_store();
    let mut reconciler = reconciler(10);
    let now = t0();

    let too_old = opened("evt-old", now - Duration::seconds(11), "z3", 1);
    assert!(matches!(
        reconciler.ingest(&store, too_old, now),
        Err(ReconcileError::Stale { .. })
    ));

    let future = opened("evt-future", now + Duration::seconds(61), "z3", 1);
    assert!(matches!(
        reconciler.ingest(&store, future, now),
        Err(ReconcileError::Validation { .. })
    ));

    reconciler
        .ingest(&store, opened("evt-a", now, "z3", 1), now)
        .unwrap();
    for event in reconciler.drain_all() {
        Reconciler::apply(&mut store, &event).unwrap();
    }

    // Within the window, but older than something already applied to z3.
    let behind = updated(
        "evt-behind",
        now - Duration::seconds(1),
        ZoneUpdate {
            zone_id: "z3".into(),
            additional_demand: quantities(&[("water", 4)]),
            ..ZoneUpdate::default()
        },
    );
    assert!(matches!(
        reconciler.ingest(&store, behind, now),
        Err(ReconcileError::Stale { .. })
    ));
    assert_eq!(store.zone("z3").unwrap().demand_of("water"), 1);
}

#[test]
fn ordering_is_tracked_per_zone() {
    let mut store = base_store();
    let mut reconciler = reconciler(0);
    let t10 = t0() + Duration::seconds(10);
    let t9 = t0() + Duration::seconds(9);

    reconciler
        .ingest(&store, opened("evt-a", t10, "zone-a", 5), t10)
        .unwrap();
    for event in reconciler.drain_all() {
        Reconciler::apply(&mut store, &event).unwrap();
    }

    // zone-b's event is older than zone-a's but nothing about zone-b has
    // been applied yet.
    assert_eq!(
        reconciler
            .ingest(&store, opened("evt-b", t9, "zone-b", 5), t9)
            .unwrap(),
        IngestOutcome::Staged
    );
    release_all(&mut reconciler, &mut store, t9);
    assert!(store.zone("zone-b").is_some());

    let late_for_a = resolved("evt-a-late", t9, "zone-a");
    assert!(matches!(
        reconciler.ingest(&store, late_for_a, t9),
        Err(ReconcileError::Stale { .. })
    ));
}

#[test]
fn settled_conflicts_are_refused_at_ingest() {
    let mut store = base_store();
    let mut reconciler = reconciler(30);
    let now = t0();

    let reopen = opened("evt-reopen", now, "z1", 10);
    assert!(matches!(
        reconciler.ingest(&store, reopen, now),
        Err(ReconcileError::Conflict { .. })
    ));
    assert_eq!(reconciler.pending(), 0);

    Reconciler::apply(&mut store, &resolved("evt-r", now, "z1")).unwrap();
    let later = now + Duration::seconds(1);
    for event in [
        resolved("evt-r2", later, "z1"),
        updated(
            "evt-u",
            later,
            ZoneUpdate {
                zone_id: "z1".into(),
                severity: Some(Severity::Critical),
                ..ZoneUpdate::default()
            },
        ),
    ] {
        assert!(matches!(
            reconciler.ingest(&store, event, later),
            Err(ReconcileError::Conflict { .. })
        ));
    }

    // Unknown zones may still be opened by an event in the buffer.
    let ghost = resolved("evt-ghost", later, "z-later");
    assert_eq!(
        reconciler.ingest(&store, ghost, later).unwrap(),
        IngestOutcome::Staged
    );
}

#[test]
fn oversized_demand_increase_is_invalid() {
    let mut store = base_store();
    let before = store.snapshot();
    let event = updated(
        "evt-huge",
        t0(),
        ZoneUpdate {
            zone_id: "z1".into(),
            additional_demand: quantities(&[("water", u64::MAX)]),
            ..ZoneUpdate::default()
        },
    );
    let mut scratch = store.clone();
    let err = Reconciler::apply(&mut scratch, &event).unwrap_err();
    assert!(matches!(err, ReconcileError::Validation { .. }), "got {err:?}");
    assert_eq!(err.code(), "validation");

    Reconciler::reject(&mut store, &event, &err);
    assert_eq!(store.zone("z1").unwrap().demand_of("water"), 50);
    assert_eq!(store.zones().count(), before.zones.len());
}

#[test]
fn road_block_and_clear_change_access() {
    let mut store = base_store();
    let block = updated(
        "evt-block",
        t0(),
        ZoneUpdate {
            zone_id: "z1".into(),
            access: Some(ZoneAccess::BoatOnly),
            ..ZoneUpdate::default()
        },
    );
    let outcome = Reconciler::apply(&mut store, &block).unwrap();
    assert!(outcome.replan);
    assert_eq!(store.zone("z1").unwrap().access, ZoneAccess::BoatOnly);
    assert!(!store.depot("A").unwrap().can_reach(store.zone("z1").unwrap()));

    let clear = updated(
        "evt-clear",
        t0() + Duration::seconds(1),
        ZoneUpdate {
            zone_id: "z1".into(),
            access: Some(ZoneAccess::RoadOpen),
            ..ZoneUpdate::default()
        },
    );
    Reconciler::apply(&mut store, &clear).unwrap();
    assert!(store.depot("A").unwrap().can_reach(store.zone("z1").unwrap()));
}

#[test]
fn resolution_returns_every_allocated_unit() {
    let mut store = base_store();
    commit(&mut store, &[("A", "z1", 30, 1.0), ("B", "z1", 20, 2.0)]);
    assert_eq!(store.depot("A").unwrap().inventory_of("water"), 70);
    let before: u64 = store.depots().map(|depot| depot.inventory_of("water")).sum();

    let outcome = Reconciler::apply(&mut store, &resolved("evt-r", t0(), "z1")).unwrap();
    let after: u64 = store.depots().map(|depot| depot.inventory_of("water")).sum();

    assert_eq!(after - before, 50);
    assert_eq!(outcome.released.get("water"), Some(&50));
    assert!(outcome.replan);
    assert_eq!(outcome.invalidate, vec!["z1".to_string()]);
    let zone = store.zone("z1").unwrap();
    assert!(zone.fulfilled.is_empty());
    assert_eq!(zone.status, ZoneStatus::Resolved);
    assert_eq!(store.allocations_for_zone("z1").count(), 0);
    store.check_invariants().unwrap();
}

#[test]
fn terminal_and_missing_zones_conflict() {
    let mut store = base_store();
    Reconciler::apply(&mut store, &resolved("evt-r1", t0(), "z1")).unwrap();

    let again = Reconciler::apply(&mut store.clone(), &resolved("evt-r2", t0(), "z1"));
    assert!(matches!(again, Err(ReconcileError::Conflict { .. })));

    let update = updated(
        "evt-u",
        t0(),
        ZoneUpdate {
            zone_id: "z1".into(),
            severity: Some(Severity::Critical),
            ..ZoneUpdate::default()
        },
    );
    assert!(matches!(
        Reconciler::apply(&mut store.clone(), &update),
        Err(ReconcileError::Conflict { .. })
    ));

    let reopen = opened("evt-o", t0(), "z1", 10);
    assert!(matches!(
        Reconciler::apply(&mut store.clone(), &reopen),
        Err(ReconcileError::Conflict { .. })
    ));

    let ghost = updated(
        "evt-g",
        t0(),
        ZoneUpdate {
            zone_id: "nowhere".into(),
            ..ZoneUpdate::default()
        },
    );
    assert!(matches!(
        Reconciler::apply(&mut store.clone(), &ghost),
        Err(ReconcileError::UnknownZone { .. })
    ));
}

#[test]
fn rejection_is_recorded_so_retries_are_duplicates() {
    let mut store = base_store();
    let mut reconciler = reconciler(0);
    let ghost = resolved("evt-ghost", t0(), "nowhere");

    reconciler.ingest(&store, ghost.clone(), t0()).unwrap();
    release_all(&mut reconciler, &mut store, t0());

    let entry = store.events().get("evt-ghost").unwrap();
    assert_eq!(entry.disposition, EventDisposition::Rejected);
    assert_eq!(
        reconciler.ingest(&store, ghost, t0()).unwrap(),
        IngestOutcome::Duplicate
    );
}

#[test]
fn restock_is_clamped_by_outstanding_allocations() {
    let mut store = base_store();
    commit(&mut store, &[("A", "z1", 30, 1.0)]);
    // A holds 70 with 30 outstanding, so it is full.
    let event = DisasterEvent::new(
        "evt-restock",
        t0(),
        EventPayload::DepotRestocked(DepotRestock {
            depot_id: "A".into(),
            quantities: quantities(&[("water", 40)]),
        }),
    );
    let outcome = Reconciler::apply(&mut store, &event).unwrap();
    assert_eq!(outcome.clamped.get("water"), Some(&40));
    assert!(!outcome.replan);
    assert_eq!(store.depot("A").unwrap().inventory_of("water"), 70);

    commit(&mut store, &[("B", "z1", 20, 2.0)]);
    let event = DisasterEvent::new(
        "evt-restock-b",
        t0(),
        EventPayload::DepotRestocked(DepotRestock {
            depot_id: "B".into(),
            quantities: quantities(&[("water", 5)]),
        }),
    );
    let outcome = Reconciler::apply(&mut store, &event).unwrap();
    assert!(outcome.clamped.is_empty());
    assert!(outcome.replan);
    assert_eq!(store.depot("B").unwrap().inventory_of("water"), 85);
    store.check_invariants().unwrap();

    let unknown = DisasterEvent::new(
        "evt-restock-x",
        t0(),
        EventPayload::DepotRestocked(DepotRestock {
            depot_id: "X".into(),
            quantities: quantities(&[("water", 5)]),
        }),
    );
    assert!(matches!(
        Reconciler::apply(&mut store.clone(), &unknown),
        Err(ReconcileError::UnknownDepot { .. })
    ));
}

#[test]
fn lowering_demand_releases_most_expensive_allocations_first() {
    let mut store = base_store();
    commit(&mut store, &[("A", "z1", 30, 1.0), ("B", "z1", 20, 5.0)]);

    let event = updated(
        "evt-lower",
        t0(),
        ZoneUpdate {
            zone_id: "z1".into(),
            demand: quantities(&[("water", 35)]),
            ..ZoneUpdate::default()
        },
    );
    let outcome = Reconciler::apply(&mut store, &event).unwrap();

    assert_eq!(outcome.released.get("water"), Some(&15));
    assert_eq!(store.zone("z1").unwrap().fulfilled_of("water"), 35);
    assert_eq!(store.depot("B").unwrap().inventory_of("water"), 95);
    assert_eq!(store.depot("A").unwrap().inventory_of("water"), 70);
    store.check_invariants().unwrap();
}

#[test]
fn unknown_asset_types_fail_validation() {
    let mut store = base_store();
    let event = updated(
        "evt-fuel",
        t0(),
        ZoneUpdate {
            zone_id: "z1".into(),
            additional_demand: quantities(&[("fuel", 10)]),
            ..ZoneUpdate::default()
        },
    );
    assert!(matches!(
        Reconciler::apply(&mut store, &event),
        Err(ReconcileError::Validation { .. })
    ));
}
