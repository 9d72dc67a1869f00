use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{AssetType, Depot, Zone};

use super::entity::{ChangeSet, EntityStore};
use super::error::{StoreError, StoreResult};

pub const ASSETS_FILE: &str = "assets.json";
pub const DEPOTS_FILE: &str = "depots.json";
pub const ZONES_FILE: &str = "zones.json";

#[derive(Debug, Deserialize)]
struct AssetsFile {
    assets: Vec<AssetType>,
}

#[derive(Debug, Deserialize)]
struct DepotsFile {
    depots: Vec<Depot>,
}

#[derive(Debug, Deserialize)]
struct ZonesFile {
    zones: Vec<Zone>,
}

/// Reference data read from a seed directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeedData {
    pub asset_types: Vec<AssetType>,
    pub depots: Vec<Depot>,
    pub zones: Vec<Zone>,
}

impl SeedData {
    /// Upserts asset types and depots; zones that already exist are left
    /// alone since they may hold allocations.
    pub fn apply_to(self, store: &mut EntityStore) -> StoreResult<ChangeSet> {
        let mut changes = ChangeSet::default();
        for asset_type in self.asset_types {
            changes.merge(store.upsert_asset_type(asset_type));
        }
        for depot in self.depots {
            changes.merge(store.upsert_depot(depot)?);
        }
        for zone in self.zones {
            if store.zone(&zone.id).is_some() {
                warn!(target: "store", zone_id = %zone.id, "seed zone already present, skipped");
                continue;
            }
            changes.merge(store.insert_zone(zone)?);
        }
        if !changes.is_empty() {
            store.bump_version();
        }
        Ok(changes)
    }
}

/// Reads `assets.json`, `depots.json` and `zones.json` from `dir`. Each file
/// holds one top-level array under the matching key.
pub fn load_seed_dir(dir: impl AsRef<Path>) -> StoreResult<SeedData> {
    let dir = dir.as_ref();
    let assets: AssetsFile = read_json(&dir.join(ASSETS_FILE))?;
    let depots: DepotsFile = read_json(&dir.join(DEPOTS_FILE))?;
    let zones: ZonesFile = read_json(&dir.join(ZONES_FILE))?;
    info!(
        target: "store",
        dir = %dir.display(),
        assets = assets.assets.len(),
        depots = depots.depots.len(),
        zones = zones.zones.len(),
        "seed data loaded"
    );
    Ok(SeedData {
        asset_types: assets.assets,
        depots: depots.depots,
        zones: zones.zones,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let content = fs::read_to_string(path).map_err(|err| StoreError::Seed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| StoreError::Seed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_seed_directory_loads() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../data/seed");
        let seed = load_seed_dir(dir).expect("seed files should parse");
        assert!(seed.asset_types.iter().any(|asset| asset.id == "water"));
        assert!(!seed.depots.is_empty());
        assert!(!seed.zones.is_empty());

        let mut store = EntityStore::new();
        let changes = seed.apply_to(&mut store).expect("seed applies");
        assert!(!changes.is_empty());
        assert_eq!(store.version(), 1);
        store.check_invariants().expect("seeded store is consistent");
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_seed_dir(dir.path()).unwrap_err();
        match err {
            StoreError::Seed { path, .. } => assert!(path.ends_with(ASSETS_FILE)),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
