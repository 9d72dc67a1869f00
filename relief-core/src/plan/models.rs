use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{total, AssetTypeId, DepotId, Quantities, ZoneId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub depot_id: DepotId,
    pub zone_id: ZoneId,
    pub asset_type: AssetTypeId,
    pub quantity: u64,
    pub unit_cost: f64,
}

impl LineItem {
    pub fn cost(&self) -> f64 {
        self.quantity as f64 * self.unit_cost
    }
}

impl fmt::Display for LineItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {} x{} @ {:.2}",
            self.depot_id, self.zone_id, self.asset_type, self.quantity, self.unit_cost
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanKpis {
    /// Share of total active demand covered once the plan is applied.
    pub coverage_percent: f64,
    /// `100 - CV * 100` over per-zone coverage, clamped to `[0, 100]`.
    pub fairness_percent: f64,
    pub median_unit_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationPlan {
    pub plan_id: String,
    pub generated_at: DateTime<Utc>,
    pub snapshot_version: u64,
    pub line_items: Vec<LineItem>,
    pub total_cost: f64,
    pub shortfall: BTreeMap<ZoneId, Quantities>,
    pub kpis: PlanKpis,
    pub rationales: Vec<String>,
}

impl AllocationPlan {
    pub fn is_empty(&self) -> bool {
        self.line_items.is_empty()
    }

    pub fn total_quantity(&self) -> u64 {
        total(self.line_items.iter().map(|item| item.quantity))
    }

    pub fn quantity_for(&self, zone_id: &str, asset_type: &str) -> u64 {
        total(
            self.line_items
                .iter()
                .filter(|item| item.zone_id == zone_id && item.asset_type == asset_type)
                .map(|item| item.quantity),
        )
    }

    pub fn drawn_from(&self, depot_id: &str, asset_type: &str) -> u64 {
        total(
            self.line_items
                .iter()
                .filter(|item| item.depot_id == depot_id && item.asset_type == asset_type)
                .map(|item| item.quantity),
        )
    }

    pub fn shortfall_of(&self, zone_id: &str, asset_type: &str) -> u64 {
        self.shortfall
            .get(zone_id)
            .and_then(|per_type| per_type.get(asset_type))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_shortfall(&self) -> bool {
        !self.shortfall.is_empty()
    }

    /// Zones in the order they first receive assets.
    pub fn zone_order(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for item in &self.line_items {
            if !seen.contains(&item.zone_id.as_str()) {
                seen.push(&item.zone_id);
            }
        }
        seen
    }
}
