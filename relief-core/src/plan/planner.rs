use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::distance::CostMatrix;
use crate::model::{total, AssetTypeId, Depot, DepotId, Quantities, Zone, ZoneId};
use crate::rational::Ratio;

use super::models::{AllocationPlan, LineItem, PlanKpis};
use super::rounding::{round_group, RoundingPolicy};

#[derive(Debug, Clone, Copy)]
pub struct PlannerOptions {
    pub rounding: RoundingPolicy,
    /// Fraction of every depot's inventory held back from planning.
    pub reserve_ratio: Ratio,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            rounding: RoundingPolicy::LargestRemainder,
            reserve_ratio: Ratio::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub plan_id: String,
    pub generated_at: DateTime<Utc>,
    pub snapshot_version: u64,
    pub depots: &'a [Depot],
    pub zones: &'a [Zone],
    pub costs: &'a CostMatrix,
}

#[derive(Debug, Clone)]
struct ExactDraw {
    depot_id: DepotId,
    zone_id: ZoneId,
    asset_type: AssetTypeId,
    quantity: Ratio,
    unit_cost: f64,
    /// Position of the depot among the eligible depots, 1 = nearest.
    rank: usize,
}

/// Greedy, severity-first allocation over exact quantities.
#[derive(Debug, Clone, Default)]
pub struct AllocationEngine {
    options: PlannerOptions,
}

impl AllocationEngine {
    pub fn new(options: PlannerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    pub fn plan(&self, input: &PlanInput<'_>) -> AllocationPlan {
        let mut available = self.working_availability(input.depots);
        let zones = prioritized(input.zones);

        let mut draws: Vec<ExactDraw> = Vec::new();
        for zone in &zones {
            for asset_type in zone.demand.keys() {
                let unfulfilled = zone.unfulfilled(asset_type);
                if unfulfilled == 0 {
                    continue;
                }
                let mut remaining = Ratio::from_integer(unfulfilled);
                let candidates = eligible_depots(input, &available, zone, asset_type);
                for (position, (depot_id, unit_cost)) in candidates.into_iter().enumerate() {
                    if remaining.is_zero() {
                        break;
                    }
                    let key = (depot_id.clone(), asset_type.clone());
                    let Some(stock) = available.get_mut(&key) else {
                        continue;
                    };
                    let quantity = (*stock).min(remaining);
                    if !quantity.is_positive() {
                        continue;
                    }
                    *stock -= quantity;
                    remaining -= quantity;
                    draws.push(ExactDraw {
                        depot_id,
                        zone_id: zone.id.clone(),
                        asset_type: asset_type.clone(),
                        quantity,
                        unit_cost,
                        rank: position + 1,
                    });
                }
            }
        }

        let mut rounded = self.round(&draws);
        clamp_to_demand(&zones, &draws, &mut rounded);
        restore_priority(self.options.rounding, &zones, &draws, &mut rounded);

        let mut line_items = Vec::new();
        let mut rationales = Vec::new();
        for (draw, quantity) in draws.iter().zip(rounded) {
            if quantity == 0 {
                continue;
            }
            let item = LineItem {
                depot_id: draw.depot_id.clone(),
                zone_id: draw.zone_id.clone(),
                asset_type: draw.asset_type.clone(),
                quantity,
                unit_cost: draw.unit_cost,
            };
            rationales.push(rationale(&zones, draw, &item));
            line_items.push(item);
        }

        let shortfall = shortfall(&zones, &line_items);
        let total_cost: f64 = line_items.iter().map(LineItem::cost).sum();
        let kpis = kpis(&zones, &line_items);

        info!(
            target: "planner",
            plan_id = %input.plan_id,
            snapshot_version = input.snapshot_version,
            line_items = line_items.len(),
            total_cost,
            short_zones = shortfall.len(),
            "plan computed"
        );

        AllocationPlan {
            plan_id: input.plan_id.clone(),
            generated_at: input.generated_at,
            snapshot_version: input.snapshot_version,
            line_items,
            total_cost,
            shortfall,
            kpis,
            rationales,
        }
    }

    fn working_availability(&self, depots: &[Depot]) -> BTreeMap<(DepotId, AssetTypeId), Ratio> {
        let keep = Ratio::ONE - self.options.reserve_ratio.min(Ratio::ONE).max(Ratio::ZERO);
        let mut available = BTreeMap::new();
        for depot in depots {
            for (asset_type, &quantity) in &depot.inventory {
                let usable = Ratio::from_integer(quantity) * keep;
                if usable.is_positive() {
                    available.insert((depot.id.clone(), asset_type.clone()), usable);
                }
            }
        }
        available
    }

    fn round(&self, draws: &[ExactDraw]) -> Vec<u64> {
        let mut groups: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
        for (index, draw) in draws.iter().enumerate() {
            groups
                .entry((draw.depot_id.as_str(), draw.asset_type.as_str()))
                .or_default()
                .push(index);
        }

        let mut rounded = vec![0; draws.len()];
        for ((depot_id, asset_type), indices) in groups {
            let exact: Vec<Ratio> = indices.iter().map(|&i| draws[i].quantity).collect();
            let whole = round_group(self.options.rounding, &exact);
            debug!(
                target: "planner",
                depot_id,
                asset_type,
                items = indices.len(),
                "rounded depot group"
            );
            for (index, quantity) in indices.into_iter().zip(whole) {
                rounded[index] = quantity;
            }
        }
        rounded
    }
}

/// Active zones, most severe first, ties by ascending id.
fn prioritized(zones: &[Zone]) -> Vec<&Zone> {
    let mut active: Vec<&Zone> = zones.iter().filter(|zone| zone.is_active()).collect();
    active.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
    active
}

fn eligible_depots(
    input: &PlanInput<'_>,
    available: &BTreeMap<(DepotId, AssetTypeId), Ratio>,
    zone: &Zone,
    asset_type: &str,
) -> Vec<(DepotId, f64)> {
    let mut eligible: Vec<(DepotId, f64)> = input
        .depots
        .iter()
        .filter(|depot| depot.can_reach(zone))
        .filter(|depot| {
            available
                .get(&(depot.id.clone(), asset_type.to_string()))
                .is_some_and(Ratio::is_positive)
        })
        .filter_map(|depot| {
            input
                .costs
                .cost(&depot.id, &zone.id)
                .filter(|cost| cost.is_finite())
                .map(|cost| (depot.id.clone(), cost))
        })
        .collect();
    eligible.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    eligible
}

/// Rounding is per depot group, so a zone served by several depots can end up
/// above its unfulfilled demand. Units that were rounded up are taken back,
/// latest line item first, until every zone/type is within demand.
fn clamp_to_demand(zones: &[&Zone], draws: &[ExactDraw], rounded: &mut [u64]) {
    for zone in zones {
        for asset_type in zone.demand.keys() {
            let limit = zone.unfulfilled(asset_type);
            let indices: Vec<usize> = draws
                .iter()
                .enumerate()
                .filter(|(_, d)| d.zone_id == zone.id && &d.asset_type == asset_type)
                .map(|(index, _)| index)
                .collect();
            let assigned = total(indices.iter().map(|&i| rounded[i]));
            let mut excess = assigned.saturating_sub(limit);
            for &index in indices.iter().rev() {
                if excess == 0 {
                    break;
                }
                let floor = draws[index].quantity.whole_units();
                let bumped = rounded[index].saturating_sub(floor).min(excess);
                rounded[index] -= bumped;
                excess -= bumped;
            }
        }
    }
}

/// Per-group rounding can leave a zone below the whole part of what its exact
/// draws covered while a less severe zone on the same depot kept a rounded-up
/// unit. Walking zones in priority order, units move up from the least
/// severe holder on the same (depot, type) group, or fill slack the clamp
/// left in the group, until each zone holds `floor(sum(exact))`.
fn restore_priority(
    policy: RoundingPolicy,
    zones: &[&Zone],
    draws: &[ExactDraw],
    rounded: &mut [u64],
) {
    let priority: BTreeMap<&str, usize> = zones
        .iter()
        .enumerate()
        .map(|(position, zone)| (zone.id.as_str(), position))
        .collect();

    for (position, zone) in zones.iter().enumerate() {
        for asset_type in zone.demand.keys() {
            let own: Vec<usize> = draws
                .iter()
                .enumerate()
                .filter(|(_, d)| d.zone_id == zone.id && &d.asset_type == asset_type)
                .map(|(index, _)| index)
                .collect();
            let target = own
                .iter()
                .map(|&i| draws[i].quantity)
                .sum::<Ratio>()
                .whole_units()
                .min(zone.unfulfilled(asset_type));
            let mut assigned = total(own.iter().map(|&i| rounded[i]));

            while assigned < target {
                let Some((receiver, donor)) =
                    next_transfer(policy, &priority, position, draws, rounded, &own)
                else {
                    break;
                };
                if let Some(donor) = donor {
                    rounded[donor] -= 1;
                }
                rounded[receiver] += 1;
                assigned += 1;
            }
        }
    }
}

/// Picks one of `own` to receive a unit, and the item that gives it up
/// (`None` when the group has unassigned whole units).
fn next_transfer(
    policy: RoundingPolicy,
    priority: &BTreeMap<&str, usize>,
    position: usize,
    draws: &[ExactDraw],
    rounded: &[u64],
    own: &[usize],
) -> Option<(usize, Option<usize>)> {
    for &receiver in own {
        let draw = &draws[receiver];
        let group: Vec<usize> = draws
            .iter()
            .enumerate()
            .filter(|(_, d)| d.depot_id == draw.depot_id && d.asset_type == draw.asset_type)
            .map(|(index, _)| index)
            .collect();

        if policy == RoundingPolicy::LargestRemainder {
            let whole = group
                .iter()
                .map(|&i| draws[i].quantity)
                .sum::<Ratio>()
                .whole_units();
            if total(group.iter().map(|&i| rounded[i])) < whole {
                return Some((receiver, None));
            }
        }

        let donor = group
            .iter()
            .copied()
            .filter(|&i| rounded[i] > 0)
            .filter_map(|i| {
                priority
                    .get(draws[i].zone_id.as_str())
                    .filter(|&&rank| rank > position)
                    .map(|&rank| (rank, i))
            })
            .max();
        if let Some((_, donor)) = donor {
            return Some((receiver, Some(donor)));
        }
    }
    None
}

fn shortfall(zones: &[&Zone], line_items: &[LineItem]) -> BTreeMap<ZoneId, Quantities> {
    let mut planned: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for item in line_items {
        let sum = planned
            .entry((item.zone_id.as_str(), item.asset_type.as_str()))
            .or_insert(0);
        *sum = sum.saturating_add(item.quantity);
    }

    let mut shortfall = BTreeMap::new();
    for zone in zones {
        let mut missing = Quantities::new();
        for asset_type in zone.demand.keys() {
            let covered = planned
                .get(&(zone.id.as_str(), asset_type.as_str()))
                .copied()
                .unwrap_or(0);
            let gap = zone.unfulfilled(asset_type).saturating_sub(covered);
            if gap > 0 {
                missing.insert(asset_type.clone(), gap);
            }
        }
        if !missing.is_empty() {
            shortfall.insert(zone.id.clone(), missing);
        }
    }
    shortfall
}

fn kpis(zones: &[&Zone], line_items: &[LineItem]) -> PlanKpis {
    let mut demand_total = 0u64;
    let mut covered_total = 0u64;
    let mut ratios = Vec::new();
    for zone in zones {
        let demand = total(zone.demand.values().copied());
        if demand == 0 {
            continue;
        }
        let planned = total(
            line_items
                .iter()
                .filter(|item| item.zone_id == zone.id)
                .map(|item| item.quantity),
        );
        let already = total(
            zone.demand
                .keys()
                .map(|asset_type| zone.fulfilled_of(asset_type).min(zone.demand_of(asset_type))),
        );
        let covered = already.saturating_add(planned).min(demand);
        demand_total = demand_total.saturating_add(demand);
        covered_total = covered_total.saturating_add(covered);
        ratios.push(covered as f64 / demand as f64);
    }

    let coverage_percent = if demand_total == 0 {
        100.0
    } else {
        covered_total as f64 / demand_total as f64 * 100.0
    };

    let fairness_percent = if ratios.is_empty() {
        100.0
    } else {
        let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
        if mean <= f64::EPSILON {
            0.0
        } else {
            let variance =
                ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratios.len() as f64;
            (100.0 - variance.sqrt() / mean * 100.0).clamp(0.0, 100.0)
        }
    };

    let mut unit_costs: Vec<f64> = line_items.iter().map(|item| item.unit_cost).collect();
    unit_costs.sort_by(f64::total_cmp);
    let median_unit_cost = match unit_costs.len() {
        0 => 0.0,
        n if n % 2 == 1 => unit_costs[n / 2],
        n => (unit_costs[n / 2 - 1] + unit_costs[n / 2]) / 2.0,
    };

    PlanKpis {
        coverage_percent,
        fairness_percent,
        median_unit_cost,
    }
}

fn rationale(zones: &[&Zone], draw: &ExactDraw, item: &LineItem) -> String {
    let severity = zones
        .iter()
        .find(|zone| zone.id == draw.zone_id)
        .map(|zone| zone.severity.as_str())
        .unwrap_or("unknown");
    let source = match draw.rank {
        1 => "nearest depot with stock".to_string(),
        2 => "next-nearest depot with stock".to_string(),
        n => format!("depot #{n} by cost"),
    };
    format!(
        "{zone} ({severity}) gets {qty} {asset} from {depot}: {source}, {cost:.1}/unit",
        zone = item.zone_id,
        qty = item.quantity,
        asset = item.asset_type,
        depot = item.depot_id,
        cost = item.unit_cost,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Location, Severity};

    fn draw(depot_id: &str, zone_id: &str, quantity: Ratio) -> ExactDraw {
        ExactDraw {
            depot_id: depot_id.to_string(),
            zone_id: zone_id.to_string(),
            asset_type: "water".to_string(),
            quantity,
            unit_cost: 1.0,
            rank: 1,
        }
    }

    #[test]
    fn rounded_up_units_are_taken_back_from_an_overserved_zone() {
        let zone = Zone::new("z", Location::new(0.0, 0.0), Severity::High).with_demand("water", 1);
        let half = Ratio::new(1, 2).unwrap();
        let draws = vec![draw("a", "z", half), draw("b", "z", half)];
        // Each depot group rounded its half up.
        let mut rounded = vec![1, 1];
        clamp_to_demand(&[&zone], &draws, &mut rounded);
        assert_eq!(rounded, vec![1, 0]);
    }

    #[test]
    fn empty_world_reports_full_coverage() {
        let costs = CostMatrix::new();
        let plan = AllocationEngine::default().plan(&PlanInput {
            plan_id: "p".into(),
            generated_at: Utc::now(),
            snapshot_version: 0,
            depots: &[],
            zones: &[],
            costs: &costs,
        });
        assert!(plan.is_empty());
        assert_eq!(plan.kpis.coverage_percent, 100.0);
        assert_eq!(plan.kpis.fairness_percent, 100.0);
        assert_eq!(plan.kpis.median_unit_cost, 0.0);
    }
}
