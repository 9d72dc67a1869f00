use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::durable::DurableStore;
use super::entity::{SaveBatch, StoreSnapshot};
use super::error::{StoreError, StoreResult};

const STORE_SCHEMA: &str = include_str!("../../../sql/relief.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Applied to writable handles only; read-only handles cannot switch journal mode.
const WRITER_PRAGMAS: &str = "PRAGMA journal_mode = WAL;\n\
                              PRAGMA synchronous = FULL;\n\
                              PRAGMA temp_store = MEMORY;\n";

fn configure_connection(conn: &Connection, writable: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if writable {
        conn.execute_batch(WRITER_PRAGMAS)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteEntityStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteEntityStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteEntityStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteEntityStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteEntityStore { path, flags })
    }
}

/// SQLite-backed [`DurableStore`]. A connection is opened per call.
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteEntityStore {
    pub fn builder() -> SqliteEntityStoreBuilder {
        SqliteEntityStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteEntityStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        let writable = !self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY);
        configure_connection(&conn, writable).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && self.flags.contains(OpenFlags::SQLITE_OPEN_CREATE)
            {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    fn load_bodies<T: DeserializeOwned>(conn: &Connection, sql: &str) -> StoreResult<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }
}

impl DurableStore for SqliteEntityStore {
    fn load_all(&self) -> StoreResult<StoreSnapshot> {
        let conn = self.open()?;
        let version = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let snapshot = StoreSnapshot {
            version,
            asset_types: Self::load_bodies(&conn, "SELECT body FROM asset_types ORDER BY id")?,
            depots: Self::load_bodies(&conn, "SELECT body FROM depots ORDER BY id")?,
            zones: Self::load_bodies(&conn, "SELECT body FROM zones ORDER BY id")?,
            allocations: Self::load_bodies(
                &conn,
                "SELECT body FROM allocations ORDER BY zone_id, depot_id, asset_type",
            )?,
            events: Self::load_bodies(&conn, "SELECT body FROM applied_events ORDER BY event_id")?,
        };
        debug!(
            target: "store",
            path = %self.path.display(),
            version,
            depots = snapshot.depots.len(),
            zones = snapshot.zones.len(),
            "entity store loaded"
        );
        Ok(snapshot)
    }

    fn save_all(&self, batch: &SaveBatch) -> StoreResult<()> {
        let mut conn = self.open()?;
        let now = Utc::now().naive_utc();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO store_meta (key, value, updated_at) VALUES ('version', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![batch.version.to_string(), now],
        )?;

        for asset in &batch.asset_types {
            tx.execute(
                "INSERT INTO asset_types (id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![&asset.id, serde_json::to_string(asset)?, now],
            )?;
        }

        for depot in &batch.depots {
            tx.execute(
                "INSERT INTO depots (id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![&depot.id, serde_json::to_string(depot)?, now],
            )?;
        }

        for zone in &batch.zones {
            tx.execute(
                "INSERT INTO zones (id, status, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![&zone.id, zone.status.as_str(), serde_json::to_string(zone)?, now],
            )?;
        }

        for entry in &batch.allocations {
            tx.execute(
                "INSERT INTO allocations (zone_id, depot_id, asset_type, quantity, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(zone_id, depot_id, asset_type) DO UPDATE SET
                    quantity = excluded.quantity,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    &entry.zone_id,
                    &entry.depot_id,
                    &entry.asset_type,
                    entry.quantity as i64,
                    serde_json::to_string(entry)?,
                    now,
                ],
            )?;
        }

        for key in &batch.removed_allocations {
            tx.execute(
                "DELETE FROM allocations WHERE zone_id = ?1 AND depot_id = ?2 AND asset_type = ?3",
                params![&key.zone_id, &key.depot_id, &key.asset_type],
            )?;
        }

        for event in &batch.events {
            tx.execute(
                "INSERT INTO applied_events (event_id, kind, disposition, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(event_id) DO UPDATE SET
                    kind = excluded.kind,
                    disposition = excluded.disposition,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    &event.event_id,
                    event.kind.as_str(),
                    serde_json::to_string(&event.disposition)?,
                    serde_json::to_string(event)?,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        debug!(
            target: "store",
            version = batch.version,
            depots = batch.depots.len(),
            zones = batch.zones.len(),
            allocations = batch.allocations.len(),
            removed = batch.removed_allocations.len(),
            events = batch.events.len(),
            "batch persisted"
        );
        Ok(())
    }
}
