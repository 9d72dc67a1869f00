use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use relief_core::{
    load_relief_config, AllocationEngine, AllocationPlan, CostMatrix, Depot, DistanceService,
    Location, PlanInput, Planar, PlannerOptions, Ratio, RoundingPolicy, Severity, Transport, Zone,
    ZoneAccess, ZoneStatus,
};

fn planar_costs(depots: &[Depot], zones: &[Zone]) -> CostMatrix {
    DistanceService::new(Arc::new(Planar::new(1.0))).matrix(depots, zones)
}

fn run(engine: &AllocationEngine, depots: &[Depot], zones: &[Zone]) -> AllocationPlan {
    let costs = planar_costs(depots, zones);
    engine.plan(&PlanInput {
        plan_id: "plan-test".to_string(),
        generated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        snapshot_version: 7,
        depots,
        zones,
        costs: &costs,
    })
}

fn two_depots_two_zones() -> (Vec<Depot>, Vec<Zone>) {
    let depots = vec![
        Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 100, 100),
        Depot::new("B", Location::new(10.0, 0.0)).with_stock("water", 100, 100),
    ];
    let zones = vec![
        Zone::new("Z1", Location::new(1.0, 0.0), Severity::Critical).with_demand("water", 80),
        Zone::new("Z2", Location::new(9.0, 0.0), Severity::Low).with_demand("water", 80),
    ];
    (depots, zones)
}

#[test]
fn two_depot_two_zone_scenario() {
    let (depots, zones) = two_depots_two_zones();
    let plan = run(&AllocationEngine::default(), &depots, &zones);

    assert_eq!(plan.quantity_for("Z1", "water"), 80);
    assert_eq!(plan.quantity_for("Z2", "water"), 80);
    assert!(!plan.has_shortfall());

    let z1: Vec<_> = plan
        .line_items
        .iter()
        .filter(|item| item.zone_id == "Z1")
        .collect();
    assert_eq!(z1.len(), 1);
    assert_eq!(z1[0].depot_id, "A");
    assert_eq!(plan.drawn_from("B", "water"), 80);
    assert_eq!(plan.zone_order(), vec!["Z1", "Z2"]);
    assert_eq!(plan.total_cost, 80.0 * 1.0 + 80.0 * 1.0);
    assert_eq!(plan.rationales.len(), plan.line_items.len());
    assert_eq!(plan.kpis.coverage_percent, 100.0);
    assert_eq!(plan.snapshot_version, 7);
}

#[test]
fn shipped_config_draws_from_full_stock() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relief.toml");
    let config = load_relief_config(path).unwrap();
    let (mut depots, zones) = two_depots_two_zones();
    depots[0] = Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 100, 100);
    depots[1] = Depot::new("B", Location::new(10.0, 0.0)).with_stock("water", 60, 60);
    let plan = run(&AllocationEngine::new(config.planner_options()), &depots, &zones);

    // Z1 empties most of A; the remaining 20 of A go to Z2 after B's 60.
    assert_eq!(plan.quantity_for("Z1", "water"), 80);
    assert_eq!(plan.drawn_from("A", "water"), 100);
    assert_eq!(plan.drawn_from("B", "water"), 60);
    assert_eq!(plan.quantity_for("Z2", "water"), 80);
    assert!(!plan.has_shortfall());
}

#[test]
fn insufficient_stock_becomes_shortfall() {
    let depots = vec![Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 100, 50)];
    let zones = vec![
        Zone::new("low", Location::new(1.0, 0.0), Severity::Low).with_demand("water", 40),
        Zone::new("crit", Location::new(5.0, 0.0), Severity::Critical).with_demand("water", 40),
    ];
    let plan = run(&AllocationEngine::default(), &depots, &zones);

    // Severity wins over distance.
    assert_eq!(plan.quantity_for("crit", "water"), 40);
    assert_eq!(plan.quantity_for("low", "water"), 10);
    assert_eq!(plan.shortfall_of("low", "water"), 30);
    assert_eq!(plan.shortfall_of("crit", "water"), 0);
    assert_eq!(plan.zone_order(), vec!["crit", "low"]);
    assert!(plan.kpis.coverage_percent < 100.0);
    assert!(plan.kpis.fairness_percent < 100.0);
}

#[test]
fn equal_severity_is_served_in_id_order() {
    let depots = vec![Depot::new("A", Location::new(0.0, 0.0)).with_stock("food", 30, 30)];
    let zones = vec![
        Zone::new("zone-b", Location::new(1.0, 0.0), Severity::High).with_demand("food", 20),
        Zone::new("zone-a", Location::new(3.0, 0.0), Severity::High).with_demand("food", 20),
    ];
    let plan = run(&AllocationEngine::default(), &depots, &zones);
    assert_eq!(plan.quantity_for("zone-a", "food"), 20);
    assert_eq!(plan.quantity_for("zone-b", "food"), 10);
}

#[test]
fn depot_cost_ties_break_on_depot_id() {
    let depots = vec![
        Depot::new("east", Location::new(1.0, 0.0)).with_stock("water", 10, 10),
        Depot::new("west", Location::new(-1.0, 0.0)).with_stock("water", 10, 10),
    ];
    let zones =
        vec![Zone::new("z", Location::new(0.0, 0.0), Severity::Medium).with_demand("water", 5)];
    let plan = run(&AllocationEngine::default(), &depots, &zones);
    assert_eq!(plan.line_items.len(), 1);
    assert_eq!(plan.line_items[0].depot_id, "east");
}

#[test]
fn identical_input_yields_identical_bytes() {
    let (depots, zones) = two_depots_two_zones();
    let engine = AllocationEngine::new(PlannerOptions {
        rounding: RoundingPolicy::LargestRemainder,
        reserve_ratio: Ratio::new(1, 10).unwrap(),
    });
    let first = serde_json::to_vec(&run(&engine, &depots, &zones)).unwrap();
    let second = serde_json::to_vec(&run(&engine, &depots, &zones)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn reserve_ratio_bounds_every_depot_draw() {
    let depots = vec![
        Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 20, 15),
        Depot::new("B", Location::new(4.0, 0.0)).with_stock("water", 20, 15),
    ];
    let zones = vec![
        Zone::new("z1", Location::new(1.0, 0.0), Severity::Critical).with_demand("water", 20),
        Zone::new("z2", Location::new(3.0, 0.0), Severity::Low).with_demand("water", 20),
    ];
    let engine = AllocationEngine::new(PlannerOptions {
        rounding: RoundingPolicy::LargestRemainder,
        reserve_ratio: Ratio::new(1, 10).unwrap(),
    });
    let plan = run(&engine, &depots, &zones);

    // 13.5 usable per depot: z1 takes 13.5 from A and 6.5 from B, z2 the 7
    // left in B. Rounding B alone would give z2 its 7 and leave z1 at 19.
    assert_eq!(plan.drawn_from("A", "water"), 13);
    assert_eq!(plan.drawn_from("B", "water"), 13);
    assert_eq!(plan.quantity_for("z1", "water"), 20);
    assert_eq!(plan.quantity_for("z2", "water"), 6);
    assert_eq!(plan.shortfall_of("z1", "water"), 0);
    assert_eq!(plan.shortfall_of("z2", "water"), 14);

    let floor = AllocationEngine::new(PlannerOptions {
        rounding: RoundingPolicy::Floor,
        reserve_ratio: Ratio::new(1, 10).unwrap(),
    });
    let floored = run(&floor, &depots, &zones);
    assert_eq!(floored.quantity_for("z1", "water"), 20);
    assert!(floored.total_quantity() <= plan.total_quantity());
    for depot in &depots {
        assert!(floored.drawn_from(&depot.id, "water") <= depot.inventory_of("water"));
    }
}

#[test]
fn already_fulfilled_and_resolved_zones_are_skipped() {
    let depots = vec![Depot::new("A", Location::new(0.0, 0.0)).with_stock("water", 100, 100)];
    let mut partly = Zone::new("partly", Location::new(1.0, 0.0), Severity::High)
        .with_demand("water", 30);
    partly.fulfilled.insert("water".into(), 25);
    let mut closed = Zone::new("closed", Location::new(1.0, 0.0), Severity::Critical)
        .with_demand("water", 30);
    closed.status = ZoneStatus::Resolved;

    let plan = run(&AllocationEngine::default(), &depots, &[partly, closed]);
    assert_eq!(plan.quantity_for("partly", "water"), 5);
    assert_eq!(plan.quantity_for("closed", "water"), 0);
    assert!(!plan.shortfall.contains_key("closed"));
}

#[test]
fn unreachable_depot_is_not_used() {
    let depots = vec![
        Depot::new("broken", Location::new(f64::NAN, 0.0)).with_stock("water", 50, 50),
        Depot::new("far", Location::new(50.0, 0.0)).with_stock("water", 50, 50),
    ];
    let zones =
        vec![Zone::new("z", Location::new(0.0, 0.0), Severity::High).with_demand("water", 10)];
    let plan = run(&AllocationEngine::default(), &depots, &zones);
    assert_eq!(plan.drawn_from("broken", "water"), 0);
    assert_eq!(plan.drawn_from("far", "water"), 10);
}

#[test]
fn boat_only_zone_skips_truck_depots() {
    let depots = vec![
        Depot::new("road", Location::new(0.0, 0.0)).with_stock("water", 50, 50),
        Depot::new("harbor", Location::new(6.0, 0.0))
            .with_stock("water", 50, 50)
            .with_fleet([Transport::Truck, Transport::Boat]),
    ];
    let mut island = Zone::new("island", Location::new(1.0, 0.0), Severity::Critical)
        .with_demand("water", 30);
    island.access = ZoneAccess::BoatOnly;
    let town =
        Zone::new("town", Location::new(1.0, 0.0), Severity::Low).with_demand("water", 30);

    let plan = run(&AllocationEngine::default(), &depots, &[island, town]);
    assert_eq!(plan.drawn_from("road", "water"), 30);
    assert_eq!(plan.quantity_for("island", "water"), 30);
    assert!(plan
        .line_items
        .iter()
        .filter(|item| item.zone_id == "island")
        .all(|item| item.depot_id == "harbor"));
}
