//! Runtime acquisition configuration.
//!
//! The sampler reads the live config at the top of each period; the
//! orchestrator is the only writer and swaps a staged config in at slot
//! boundaries, persisting it as a JSON blob under the `cfg` namespace.

use serde::{Deserialize, Serialize};

use crate::app::ports::StoragePort;
use crate::error::Error;
use crate::sample::{FieldId, ALL_FIELDS};

const NS_CFG: &str = "cfg";
const KEY_RUNTIME: &str = "runtime";

/// Bounds for the sampling period. The lower bound keeps the device
/// endpoint from being hammered; the upper bound keeps a window from
/// going empty for an hour.
const MIN_SAMPLING_MS: u32 = 200;
const MAX_SAMPLING_MS: u32 = 3_600_000;

/// Live acquisition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sampling period in milliseconds.
    pub sampling_interval: u32,
    /// Ordered, de-duplicated subset of the canonical fields.
    pub fields: Vec<FieldId>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sampling_interval: 5_000,
            fields: ALL_FIELDS.to_vec(),
        }
    }
}

impl RuntimeConfig {
    /// Whether the full canonical set is selected.
    pub fn selects_all(&self) -> bool {
        self.fields.len() == ALL_FIELDS.len()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_SAMPLING_MS..=MAX_SAMPLING_MS).contains(&self.sampling_interval) {
            return Err(Error::Config("sampling_interval out of range"));
        }
        if self.fields.is_empty() {
            return Err(Error::Config("empty field selection"));
        }
        Ok(())
    }

    /// Load the persisted config, falling back to defaults when absent or
    /// unreadable.
    pub fn load(store: &impl StoragePort) -> Self {
        let Some(json) = store.get_str(NS_CFG, KEY_RUNTIME) else {
            return Self::default();
        };
        match serde_json::from_str::<Self>(&json) {
            Ok(cfg) if cfg.validate().is_ok() => cfg,
            _ => {
                log::warn!("config: persisted runtime config unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// Persist the config as JSON.
    pub fn save(&self, store: &mut impl StoragePort) -> Result<(), Error> {
        let json = serde_json::to_string(self).map_err(|_| Error::Storage)?;
        store
            .set_str(NS_CFG, KEY_RUNTIME, &json)
            .map_err(|_| Error::Storage)
    }
}

/// Map cloud-supplied register names to field ids: lower-cased aliases,
/// then sorted and de-duplicated. The whole list is rejected if any name
/// is unknown or the result is empty.
pub fn map_field_names(names: &[String]) -> Result<Vec<FieldId>, Error> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match FieldId::from_name(name) {
            Some(f) => out.push(f),
            None => return Err(Error::Config("unknown register name")),
        }
    }
    if out.is_empty() {
        return Err(Error::Config("empty register list"));
    }
    out.sort();
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsStore;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_selects_all_fields_at_5s() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.selects_all());
        assert_eq!(cfg.sampling_interval, 5_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn aliases_sort_and_dedup() {
        let out = map_field_names(&names(&["power", "VOLTAGE", "pac", "temperature"])).unwrap();
        assert_eq!(out, vec![FieldId::Vac1, FieldId::Temp, FieldId::Pac]);
    }

    #[test]
    fn unknown_name_rejects_whole_list() {
        assert!(map_field_names(&names(&["vac1", "warp_core"])).is_err());
        assert!(map_field_names(&[]).is_err());
    }

    #[test]
    fn validation_bounds() {
        let mut cfg = RuntimeConfig::default();
        cfg.sampling_interval = 50;
        assert!(cfg.validate().is_err());
        cfg.sampling_interval = 5_000;
        cfg.fields.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn persistence_round_trip() {
        let mut store = NvsStore::new().unwrap();
        let cfg = RuntimeConfig {
            sampling_interval: 2_000,
            fields: vec![FieldId::Vac1, FieldId::Pac],
        };
        cfg.save(&mut store).unwrap();
        assert_eq!(RuntimeConfig::load(&store), cfg);
    }

    #[test]
    fn load_falls_back_on_garbage() {
        let mut store = NvsStore::new().unwrap();
        store.set_str("cfg", "runtime", "{not json").unwrap();
        assert_eq!(RuntimeConfig::load(&store), RuntimeConfig::default());
    }
}
