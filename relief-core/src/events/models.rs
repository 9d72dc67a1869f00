use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::distance::validate_location;
use crate::model::{DepotId, Location, Quantities, Severity, ZoneAccess, ZoneId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ZoneOpened,
    ZoneUpdated,
    ZoneResolved,
    DepotRestocked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ZoneOpened => "ZONE_OPENED",
            EventKind::ZoneUpdated => "ZONE_UPDATED",
            EventKind::ZoneResolved => "ZONE_RESOLVED",
            EventKind::DepotRestocked => "DEPOT_RESTOCKED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneOpened {
    pub zone_id: ZoneId,
    #[serde(default)]
    pub name: Option<String>,
    pub location: Location,
    pub severity: Severity,
    #[serde(default)]
    pub population: u64,
    #[serde(default)]
    pub demand: Quantities,
    #[serde(default)]
    pub access: ZoneAccess,
}

/// Partial update of an active zone. `demand` replaces per-type demand,
/// `additional_demand` is added on top of whatever the zone already needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ZoneUpdate {
    pub zone_id: ZoneId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Road blocked or cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ZoneAccess>,
    #[serde(default, skip_serializing_if = "Quantities::is_empty")]
    pub demand: Quantities,
    #[serde(default, skip_serializing_if = "Quantities::is_empty")]
    pub additional_demand: Quantities,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepotRestock {
    pub depot_id: DepotId,
    pub quantities: Quantities,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    ZoneOpened(ZoneOpened),
    ZoneUpdated(ZoneUpdate),
    ZoneResolved { zone_id: ZoneId },
    DepotRestocked(DepotRestock),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisasterEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DisasterEvent {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            id: id.into(),
            timestamp,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::ZoneOpened(_) => EventKind::ZoneOpened,
            EventPayload::ZoneUpdated(_) => EventKind::ZoneUpdated,
            EventPayload::ZoneResolved { .. } => EventKind::ZoneResolved,
            EventPayload::DepotRestocked(_) => EventKind::DepotRestocked,
        }
    }

    /// The zone or depot the event is about.
    pub fn subject(&self) -> &str {
        match &self.payload {
            EventPayload::ZoneOpened(opened) => &opened.zone_id,
            EventPayload::ZoneUpdated(update) => &update.zone_id,
            EventPayload::ZoneResolved { zone_id } => zone_id,
            EventPayload::DepotRestocked(restock) => &restock.depot_id,
        }
    }

    /// Shape checks that need no store state.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("event id must not be empty".to_string());
        }
        if self.subject().trim().is_empty() {
            return Err(format!("{} without a subject id", self.kind()));
        }
        match &self.payload {
            EventPayload::ZoneOpened(opened) => {
                validate_location(&opened.location).map_err(|err| err.to_string())?;
                validate_quantities(&opened.demand)
            }
            EventPayload::ZoneUpdated(update) => {
                if let Some(location) = &update.location {
                    validate_location(location).map_err(|err| err.to_string())?;
                }
                validate_quantities(&update.demand)?;
                validate_quantities(&update.additional_demand)
            }
            EventPayload::ZoneResolved { .. } => Ok(()),
            EventPayload::DepotRestocked(restock) => {
                if restock.quantities.is_empty() {
                    return Err("restock without quantities".to_string());
                }
                validate_quantities(&restock.quantities)
            }
        }
    }
}

fn validate_quantities(quantities: &Quantities) -> Result<(), String> {
    if quantities.keys().any(|asset_type| asset_type.trim().is_empty()) {
        return Err("empty asset type id".to_string());
    }
    Ok(())
}
