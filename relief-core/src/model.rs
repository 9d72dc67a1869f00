use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type DepotId = String;
pub type ZoneId = String;
pub type AssetTypeId = String;

/// Quantities keyed by asset type, in whole units.
pub type Quantities = BTreeMap<AssetTypeId, u64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetType {
    pub id: AssetTypeId,
    pub unit: String,
}

impl AssetType {
    pub fn new(id: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit: unit.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    #[default]
    Active,
    Resolved,
}

impl ZoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneStatus::Active => "active",
            ZoneStatus::Resolved => "resolved",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, ZoneStatus::Resolved)
    }
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a zone can currently be reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAccess {
    #[default]
    RoadOpen,
    BoatOnly,
    Both,
}

impl ZoneAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneAccess::RoadOpen => "road_open",
            ZoneAccess::BoatOnly => "boat_only",
            ZoneAccess::Both => "both",
        }
    }

    pub fn admits(&self, transport: Transport) -> bool {
        matches!(
            (self, transport),
            (ZoneAccess::Both, _)
                | (ZoneAccess::RoadOpen, Transport::Truck)
                | (ZoneAccess::BoatOnly, Transport::Boat)
        )
    }
}

impl fmt::Display for ZoneAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Truck,
    Boat,
}

fn default_fleet() -> BTreeSet<Transport> {
    BTreeSet::from([Transport::Truck])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Depot {
    pub id: DepotId,
    #[serde(default)]
    pub name: String,
    pub location: Location,
    #[serde(default)]
    pub capacity: Quantities,
    #[serde(default)]
    pub inventory: Quantities,
    /// Vehicles the depot dispatches with; trucks only unless stated.
    #[serde(default = "default_fleet")]
    pub fleet: BTreeSet<Transport>,
}

impl Depot {
    pub fn new(id: impl Into<String>, location: Location) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            location,
            capacity: Quantities::new(),
            inventory: Quantities::new(),
            fleet: default_fleet(),
        }
    }

    pub fn with_fleet(mut self, fleet: impl IntoIterator<Item = Transport>) -> Self {
        self.fleet = fleet.into_iter().collect();
        self
    }

    pub fn with_stock(
        mut self,
        asset_type: impl Into<String>,
        capacity: u64,
        inventory: u64,
    ) -> Self {
        let asset_type = asset_type.into();
        self.capacity.insert(asset_type.clone(), capacity);
        self.inventory.insert(asset_type, inventory.min(capacity));
        self
    }

    pub fn inventory_of(&self, asset_type: &str) -> u64 {
        self.inventory.get(asset_type).copied().unwrap_or(0)
    }

    pub fn capacity_of(&self, asset_type: &str) -> u64 {
        self.capacity.get(asset_type).copied().unwrap_or(0)
    }

    /// Whether any vehicle in the fleet may enter `zone`.
    pub fn can_reach(&self, zone: &Zone) -> bool {
        self.fleet.iter().any(|&transport| zone.access.admits(transport))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    #[serde(default)]
    pub name: String,
    pub location: Location,
    pub severity: Severity,
    #[serde(default)]
    pub population: u64,
    #[serde(default)]
    pub demand: Quantities,
    #[serde(default)]
    pub fulfilled: Quantities,
    #[serde(default)]
    pub access: ZoneAccess,
    #[serde(default)]
    pub status: ZoneStatus,
}

impl Zone {
    pub fn new(id: impl Into<String>, location: Location, severity: Severity) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            location,
            severity,
            population: 0,
            demand: Quantities::new(),
            fulfilled: Quantities::new(),
            access: ZoneAccess::default(),
            status: ZoneStatus::Active,
        }
    }

    pub fn with_demand(mut self, asset_type: impl Into<String>, quantity: u64) -> Self {
        self.demand.insert(asset_type.into(), quantity);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ZoneStatus::Active
    }

    pub fn demand_of(&self, asset_type: &str) -> u64 {
        self.demand.get(asset_type).copied().unwrap_or(0)
    }

    pub fn fulfilled_of(&self, asset_type: &str) -> u64 {
        self.fulfilled.get(asset_type).copied().unwrap_or(0)
    }

    pub fn unfulfilled(&self, asset_type: &str) -> u64 {
        self.demand_of(asset_type)
            .saturating_sub(self.fulfilled_of(asset_type))
    }

    pub fn total_unfulfilled(&self) -> u64 {
        total(self.demand.keys().map(|asset_type| self.unfulfilled(asset_type)))
    }
}

/// Saturating sum of unit counts.
pub(crate) fn total(quantities: impl IntoIterator<Item = u64>) -> u64 {
    quantities
        .into_iter()
        .fold(0u64, |sum, quantity| sum.saturating_add(quantity))
}

/// Adds `amount` to the entry for `key`, saturating at `u64::MAX`; a zero
/// amount never creates an entry.
pub(crate) fn add_quantity(map: &mut Quantities, key: &str, amount: u64) {
    if amount == 0 {
        return;
    }
    let entry = map.entry(key.to_string()).or_insert(0);
    *entry = entry.saturating_add(amount);
}

/// Subtracts `amount` (saturating) and removes the entry once it hits zero.
pub(crate) fn sub_quantity(map: &mut Quantities, key: &str, amount: u64) {
    if let Some(current) = map.get_mut(key) {
        *current = current.saturating_sub(amount);
        if *current == 0 {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        let mut levels = vec![
            Severity::High,
            Severity::Low,
            Severity::Critical,
            Severity::Medium,
        ];
        levels.sort();
        assert_eq!(
            levels,
            vec![
                Severity::Low,
                Severity::Medium,
                Severity::High,
                Severity::Critical
            ]
        );
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
    }

    #[test]
    fn unfulfilled_never_underflows() {
        let mut zone = Zone::new("z", Location::new(0.0, 0.0), Severity::Low).with_demand("water", 10);
        zone.fulfilled.insert("water".into(), 12);
        assert_eq!(zone.unfulfilled("water"), 0);
        assert_eq!(zone.unfulfilled("food"), 0);
    }

    #[test]
    fn blocked_roads_need_a_boat() {
        let mut zone = Zone::new("z", Location::new(0.0, 0.0), Severity::High);
        let trucks = Depot::new("t", Location::new(0.0, 0.0));
        let mixed = Depot::new("m", Location::new(0.0, 0.0))
            .with_fleet([Transport::Truck, Transport::Boat]);
        assert!(trucks.can_reach(&zone));

        zone.access = ZoneAccess::BoatOnly;
        assert!(!trucks.can_reach(&zone));
        assert!(mixed.can_reach(&zone));

        let depot: Depot =
            serde_json::from_str(r#"{"id":"d","location":{"lat":0.0,"lon":0.0}}"#).unwrap();
        assert_eq!(depot.fleet, BTreeSet::from([Transport::Truck]));
    }

    #[test]
    fn quantity_sums_saturate() {
        let mut demand = Quantities::new();
        add_quantity(&mut demand, "water", u64::MAX);
        add_quantity(&mut demand, "water", 5);
        assert_eq!(demand["water"], u64::MAX);
        assert_eq!(total([u64::MAX, 1, 2]), u64::MAX);
        add_quantity(&mut demand, "food", 0);
        assert!(!demand.contains_key("food"));
    }
}
