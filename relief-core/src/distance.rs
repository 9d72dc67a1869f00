use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Depot, DepotId, Location, Zone, ZoneId};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("coordinates ({lat}, {lon}) are not finite")]
    NonFinite { lat: f64, lon: f64 },
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("no location registered for {0}")]
    UnknownEntity(String),
    #[error("cost function produced invalid cost {0}")]
    InvalidCost(f64),
}

/// Rejects coordinates a geographic cost model cannot work with.
pub fn validate_location(location: &Location) -> Result<(), GeometryError> {
    if !location.lat.is_finite() || !location.lon.is_finite() {
        return Err(GeometryError::NonFinite {
            lat: location.lat,
            lon: location.lon,
        });
    }
    if !(-90.0..=90.0).contains(&location.lat) {
        return Err(GeometryError::LatitudeOutOfRange(location.lat));
    }
    if !(-180.0..=180.0).contains(&location.lon) {
        return Err(GeometryError::LongitudeOutOfRange(location.lon));
    }
    Ok(())
}

/// Travel cost between two points. Implementations must be pure and return a
/// finite, non-negative cost or a [`GeometryError`].
pub trait CostFunction: fmt::Debug + Send + Sync {
    fn cost(&self, from: Location, to: Location) -> Result<f64, GeometryError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceModel {
    #[default]
    GreatCircle,
    Planar,
}

/// Haversine distance converted to travel minutes at a fixed speed.
#[derive(Debug, Clone)]
pub struct GreatCircle {
    pub speed_kmph: f64,
}

impl GreatCircle {
    pub fn new(speed_kmph: f64) -> Self {
        Self { speed_kmph }
    }

    pub fn haversine_km(from: Location, to: Location) -> f64 {
        let phi1 = from.lat.to_radians();
        let phi2 = to.lat.to_radians();
        let d_phi = (to.lat - from.lat).to_radians();
        let d_lambda = (to.lon - from.lon).to_radians();
        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

impl Default for GreatCircle {
    fn default() -> Self {
        Self::new(35.0)
    }
}

impl CostFunction for GreatCircle {
    fn cost(&self, from: Location, to: Location) -> Result<f64, GeometryError> {
        validate_location(&from)?;
        validate_location(&to)?;
        let speed = self.speed_kmph.max(1e-6);
        Ok(Self::haversine_km(from, to) / speed * 60.0)
    }
}

/// Straight-line distance on the raw coordinates, for synthetic grids.
#[derive(Debug, Clone)]
pub struct Planar {
    pub cost_per_unit: f64,
}

impl Planar {
    pub fn new(cost_per_unit: f64) -> Self {
        Self { cost_per_unit }
    }
}

impl CostFunction for Planar {
    fn cost(&self, from: Location, to: Location) -> Result<f64, GeometryError> {
        for point in [from, to] {
            if !point.lat.is_finite() || !point.lon.is_finite() {
                return Err(GeometryError::NonFinite {
                    lat: point.lat,
                    lon: point.lon,
                });
            }
        }
        Ok((to.lat - from.lat).hypot(to.lon - from.lon) * self.cost_per_unit)
    }
}

/// Feasible depot→zone costs for one planning pass. Pairs that are absent are
/// infeasible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostMatrix {
    entries: BTreeMap<(DepotId, ZoneId), f64>,
}

impl CostMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, depot_id: impl Into<String>, zone_id: impl Into<String>, cost: f64) {
        self.entries.insert((depot_id.into(), zone_id.into()), cost);
    }

    pub fn cost(&self, depot_id: &str, zone_id: &str) -> Option<f64> {
        self.entries
            .get(&(depot_id.to_string(), zone_id.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistanceStats {
    pub hits: u64,
    pub misses: u64,
    pub cached: usize,
}

/// Lazily computes and caches depot→zone costs.
///
/// Locations are registered per entity; when a registered location changes
/// only the entries touching that entity are dropped.
#[derive(Debug)]
pub struct DistanceService {
    cost_fn: Arc<dyn CostFunction>,
    depots: BTreeMap<DepotId, Location>,
    zones: BTreeMap<ZoneId, Location>,
    cache: BTreeMap<(DepotId, ZoneId), Result<f64, GeometryError>>,
    hits: u64,
    misses: u64,
}

impl DistanceService {
    pub fn new(cost_fn: Arc<dyn CostFunction>) -> Self {
        Self {
            cost_fn,
            depots: BTreeMap::new(),
            zones: BTreeMap::new(),
            cache: BTreeMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn great_circle(speed_kmph: f64) -> Self {
        Self::new(Arc::new(GreatCircle::new(speed_kmph)))
    }

    pub fn register_depot(&mut self, depot_id: &str, location: Location) {
        if self.depots.get(depot_id) != Some(&location) {
            self.invalidate(depot_id);
            self.depots.insert(depot_id.to_string(), location);
        }
    }

    pub fn register_zone(&mut self, zone_id: &str, location: Location) {
        if self.zones.get(zone_id) != Some(&location) {
            self.invalidate(zone_id);
            self.zones.insert(zone_id.to_string(), location);
        }
    }

    /// Drops every cached entry that references `entity_id`.
    pub fn invalidate(&mut self, entity_id: &str) {
        let before = self.cache.len();
        self.cache
            .retain(|(depot_id, zone_id), _| depot_id != entity_id && zone_id != entity_id);
        let dropped = before - self.cache.len();
        if dropped > 0 {
            debug!(target: "distance", entity_id, dropped, "invalidated cached costs");
        }
    }

    /// Forgets an entity entirely, e.g. a resolved zone.
    pub fn forget(&mut self, entity_id: &str) {
        self.invalidate(entity_id);
        self.depots.remove(entity_id);
        self.zones.remove(entity_id);
    }

    pub fn cost(&mut self, depot_id: &str, zone_id: &str) -> Result<f64, GeometryError> {
        let key = (depot_id.to_string(), zone_id.to_string());
        if let Some(cached) = self.cache.get(&key) {
            self.hits += 1;
            return cached.clone();
        }
        self.misses += 1;
        let computed = self.compute(depot_id, zone_id);
        if let Err(err) = &computed {
            warn!(
                target: "distance",
                depot_id,
                zone_id,
                error = %err,
                "pair treated as infeasible"
            );
        }
        self.cache.insert(key, computed.clone());
        computed
    }

    fn compute(&self, depot_id: &str, zone_id: &str) -> Result<f64, GeometryError> {
        let from = self
            .depots
            .get(depot_id)
            .ok_or_else(|| GeometryError::UnknownEntity(depot_id.to_string()))?;
        let to = self
            .zones
            .get(zone_id)
            .ok_or_else(|| GeometryError::UnknownEntity(zone_id.to_string()))?;
        let cost = self.cost_fn.cost(*from, *to)?;
        if !cost.is_finite() || cost < 0.0 {
            return Err(GeometryError::InvalidCost(cost));
        }
        Ok(cost)
    }

    /// Registers the given entities and returns the feasible cost matrix.
    pub fn matrix(&mut self, depots: &[Depot], zones: &[Zone]) -> CostMatrix {
        for depot in depots {
            self.register_depot(&depot.id, depot.location);
        }
        for zone in zones {
            self.register_zone(&zone.id, zone.location);
        }

        let mut matrix = CostMatrix::new();
        for depot in depots {
            for zone in zones {
                if let Ok(cost) = self.cost(&depot.id, &zone.id) {
                    matrix.insert(depot.id.clone(), zone.id.clone(), cost);
                }
            }
        }
        matrix
    }

    pub fn stats(&self) -> DistanceStats {
        DistanceStats {
            hits: self.hits,
            misses: self.misses,
            cached: self.cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    fn depot(id: &str, lat: f64, lon: f64) -> Depot {
        Depot::new(id, Location::new(lat, lon))
    }

    fn zone(id: &str, lat: f64, lon: f64) -> Zone {
        Zone::new(id, Location::new(lat, lon), Severity::High)
    }

    #[test]
    fn haversine_matches_known_distance() {
        // One degree of longitude on the equator.
        let km = GreatCircle::haversine_km(Location::new(0.0, 0.0), Location::new(0.0, 1.0));
        assert!((km - 111.19).abs() < 0.01, "got {km}");
    }

    #[test]
    fn second_query_is_served_from_cache() {
        let mut service = DistanceService::great_circle(60.0);
        let depots = vec![depot("a", 0.0, 0.0)];
        let zones = vec![zone("z", 0.0, 1.0)];
        let first = service.matrix(&depots, &zones);
        let second = service.matrix(&depots, &zones);
        assert_eq!(first, second);
        let stats = service.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        // 111.19 km at 60 km/h.
        let minutes = first.cost("a", "z").unwrap();
        assert!((minutes - 111.19).abs() < 0.01);
    }

    #[test]
    fn relocation_only_drops_entries_for_that_entity() {
        let mut service = DistanceService::great_circle(35.0);
        let depots = vec![depot("a", 0.0, 0.0), depot("b", 0.0, 10.0)];
        let mut zones = vec![zone("z1", 0.0, 1.0), zone("z2", 0.0, 9.0)];
        service.matrix(&depots, &zones);
        assert_eq!(service.stats().cached, 4);

        zones[0].location = Location::new(1.0, 1.0);
        service.register_zone("z1", zones[0].location);
        assert_eq!(service.stats().cached, 2);

        service.matrix(&depots, &zones);
        assert_eq!(service.stats().misses, 6);
        assert_eq!(service.stats().hits, 2);
    }

    #[test]
    fn malformed_coordinates_make_a_single_pair_infeasible() {
        let mut service = DistanceService::great_circle(35.0);
        let depots = vec![depot("good", 0.0, 0.0), depot("bad", 123.0, 0.0)];
        let zones = vec![zone("z", 0.0, 1.0)];
        let matrix = service.matrix(&depots, &zones);
        assert!(matrix.cost("good", "z").is_some());
        assert!(matrix.cost("bad", "z").is_none());
        assert_eq!(
            service.cost("bad", "z"),
            Err(GeometryError::LatitudeOutOfRange(123.0))
        );
        assert!(matches!(
            service.cost("missing", "z"),
            Err(GeometryError::UnknownEntity(_))
        ));
    }

    #[test]
    fn planar_cost_is_euclidean() {
        let planar = Planar::new(2.0);
        let cost = planar
            .cost(Location::new(0.0, 0.0), Location::new(3.0, 4.0))
            .unwrap();
        assert_eq!(cost, 10.0);
        assert!(planar
            .cost(Location::new(f64::NAN, 0.0), Location::new(0.0, 0.0))
            .is_err());
    }
}
