//! Business payloads as a tagged union keyed by collection.
//!
//! The engine never looks inside a document; the union exists so that
//! merge and compare logic is type-checked per collection instead of
//! operating on untyped blobs. Each document carries an explicit
//! `schema_version` so payload schemas can evolve independently.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The remote collections the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Construction and maintenance projects.
    Projects,
    /// Equipment and vehicle records.
    Equipment,
    /// Job estimates.
    Estimates,
    /// Material inventory.
    Inventory,
}

impl Collection {
    /// All collections, in a stable order.
    pub const ALL: [Collection; 4] = [
        Collection::Projects,
        Collection::Equipment,
        Collection::Estimates,
        Collection::Inventory,
    ];

    /// Returns the stable wire/storage name of the collection.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Equipment => "equipment",
            Collection::Estimates => "estimates",
            Collection::Inventory => "inventory",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized collection name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown collection: {0}")]
pub struct UnknownCollection(pub String);

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(Collection::Projects),
            "equipment" => Ok(Collection::Equipment),
            "estimates" => Ok(Collection::Estimates),
            "inventory" => Ok(Collection::Inventory),
            other => Err(UnknownCollection(other.to_string())),
        }
    }
}

/// A project document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDoc {
    /// Payload schema version.
    pub schema_version: u16,
    /// Display name.
    pub name: String,
    /// Free-form status label ("bidding", "paving", "closed", ...).
    pub status: String,
    /// Site address or description.
    pub site: Option<String>,
    /// Field notes.
    pub notes: Option<String>,
}

/// An equipment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentDoc {
    /// Payload schema version.
    pub schema_version: u16,
    /// Display name.
    pub name: String,
    /// Asset tag or fleet number.
    pub asset_tag: Option<String>,
    /// Whether the unit is currently operational.
    pub operational: bool,
    /// Accumulated engine hours.
    pub engine_hours: Option<f64>,
}

/// An estimate document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateDoc {
    /// Payload schema version.
    pub schema_version: u16,
    /// Customer name.
    pub customer: String,
    /// Quoted amount in cents.
    pub amount_cents: i64,
    /// Whether the estimate was accepted.
    pub accepted: Option<bool>,
}

/// An inventory document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryDoc {
    /// Payload schema version.
    pub schema_version: u16,
    /// Stock-keeping unit.
    pub sku: String,
    /// Quantity on hand.
    pub quantity: i64,
    /// Storage location.
    pub location: Option<String>,
}

/// A business payload, tagged by the collection it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "doc", rename_all = "snake_case")]
pub enum Payload {
    /// A project document.
    Projects(ProjectDoc),
    /// An equipment document.
    Equipment(EquipmentDoc),
    /// An estimate document.
    Estimates(EstimateDoc),
    /// An inventory document.
    Inventory(InventoryDoc),
}

impl Payload {
    /// Returns the collection this payload belongs to.
    #[must_use]
    pub fn collection(&self) -> Collection {
        match self {
            Payload::Projects(_) => Collection::Projects,
            Payload::Equipment(_) => Collection::Equipment,
            Payload::Estimates(_) => Collection::Estimates,
            Payload::Inventory(_) => Collection::Inventory,
        }
    }

    /// Returns the payload's schema version.
    #[must_use]
    pub fn schema_version(&self) -> u16 {
        match self {
            Payload::Projects(doc) => doc.schema_version,
            Payload::Equipment(doc) => doc.schema_version,
            Payload::Estimates(doc) => doc.schema_version,
            Payload::Inventory(doc) => doc.schema_version,
        }
    }
}
