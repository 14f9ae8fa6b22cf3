//! Measurement catalog: maps raw device data-point keys to named,
//! scaled, unit-tagged measurement definitions.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Catalog construction errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Duplicate data-point key '{0}'")]
    DuplicateKey(String),
    #[error("Duplicate measurement name '{0}'")]
    DuplicateName(String),
}

/// How one raw data point becomes a measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct PointDef {
    /// Downstream series name (payload key, fan-out topic suffix)
    pub name: String,

    /// Multiplier applied to the raw value
    pub scale: f64,

    /// Unit label carried in the aggregate payload (may be empty)
    pub units: String,
}

impl PointDef {
    pub fn new(name: &str, scale: f64, units: &str) -> Self {
        Self {
            name: name.to_string(),
            scale,
            units: units.to_string(),
        }
    }
}

/// Lookup table from raw data-point key to measurement definition.
///
/// Raw keys absent from the catalog stay invisible downstream; tracking
/// another data point is a catalog edit, nothing more.
#[derive(Debug, Clone)]
pub struct Catalog {
    points: BTreeMap<String, PointDef>,
}

impl Catalog {
    /// Build a catalog from (raw key, definition) pairs.
    ///
    /// Rejects duplicate raw keys and duplicate measurement names, so
    /// every definition maps to a distinct downstream series.
    pub fn from_defs<I>(defs: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (String, PointDef)>,
    {
        let mut points = BTreeMap::new();
        let mut names = BTreeSet::new();

        for (key, def) in defs {
            if !names.insert(def.name.clone()) {
                return Err(CatalogError::DuplicateName(def.name));
            }
            if points.contains_key(&key) {
                return Err(CatalogError::DuplicateKey(key));
            }
            points.insert(key, def);
        }

        Ok(Self { points })
    }

    /// Built-in table for the dual-clamp energy meter.
    pub fn energy_meter() -> Self {
        let defs = [
            ("101", "power_a", 0.1, "W"),
            ("105", "power_b", 0.1, "W"),
            ("106", "energy_forward_a", 0.01, "kWh"),
            ("107", "energy_reverse_a", 0.01, "kWh"),
            ("108", "energy_forward_b", 0.01, "kWh"),
            ("109", "energy_reverse_b", 0.01, "kWh"),
            ("110", "power_factor_a", 0.01, ""),
            ("111", "frequency", 0.01, "Hz"),
            ("112", "voltage", 0.1, "V"),
            ("113", "current_a", 0.001, "A"),
            ("114", "current_b", 0.001, "A"),
            ("121", "power_factor_b", 0.01, ""),
        ];

        let points = defs
            .into_iter()
            .map(|(key, name, scale, units)| (key.to_string(), PointDef::new(name, scale, units)))
            .collect();

        Self { points }
    }

    /// Look up the definition for a raw data-point key.
    pub fn get(&self, key: &str) -> Option<&PointDef> {
        self.points.get(key)
    }

    /// Iterate definitions in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PointDef)> {
        self.points.iter().map(|(key, def)| (key.as_str(), def))
    }

    /// Number of active definitions.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
