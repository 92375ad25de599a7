use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Result, SoundstageError};

/// Opaque preset payload understood by the visualisation sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresetData(pub Value);

impl PresetData {
    /// Reads a numeric parameter, if the preset defines one.
    pub fn param(&self, key: &str) -> Option<f32> {
        self.0.get(key)?.as_f64().map(|value| value as f32)
    }
}

/// Synchronous name → preset lookup, fully loaded up front.
pub trait PresetCatalog: Send + Sync {
    /// All preset names in catalog order.
    fn names(&self) -> Vec<String>;

    fn get(&self, name: &str) -> Option<PresetData>;

    fn len(&self) -> usize {
        self.names().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Catalog backed by a JSON object mapping preset names to preset payloads.
#[derive(Debug, Clone, Default)]
pub struct JsonPresetCatalog {
    entries: Vec<(String, PresetData)>,
}

impl JsonPresetCatalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let catalog = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.as_ref().display(),
            presets = catalog.entries.len(),
            "loaded preset catalog"
        );
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(Self {
                entries: map
                    .into_iter()
                    .map(|(name, data)| (name, PresetData(data)))
                    .collect(),
            }),
            _ => Err(SoundstageError::msg(
                "preset catalog must be a JSON object keyed by preset name",
            )),
        }
    }

    /// Small catalog shipped with the binary.
    pub fn builtin() -> Self {
        let entries = [
            ("Flexi - alien fish pond", json!({ "gain": 1.4, "decay": 0.92, "hue": 0.55 })),
            ("Geiss - Cosmic Dust 2", json!({ "gain": 0.8, "decay": 0.97, "hue": 0.1 })),
            ("Martin - mucus cervix", json!({ "gain": 2.5, "decay": 0.5, "hue": 0.9 })),
            ("Rovastar - Fractopia", json!({ "gain": 1.0, "decay": 0.9, "hue": 0.33 })),
            ("Zylot - Star Ornament", json!({ "gain": 1.2, "decay": 0.85, "hue": 0.75 })),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(name, data)| (name.to_string(), PresetData(data)))
                .collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, data: PresetData) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = data,
            None => self.entries.push((name, data)),
        }
    }
}

impl PresetCatalog for JsonPresetCatalog {
    fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    fn get(&self, name: &str) -> Option<PresetData> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, data)| data.clone())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_catalog_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "b": {{ "gain": 2.0 }}, "a": {{ "hue": 0.5 }} }}"#).unwrap();

        let catalog = JsonPresetCatalog::from_path(file.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("b").and_then(|p| p.param("gain")), Some(2.0));
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn catalog_keeps_file_order() {
        let catalog = JsonPresetCatalog::from_json_str(r#"{"zeta": {}, "alpha": {}, "mid": {}}"#)
            .unwrap();
        assert_eq!(catalog.names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn rejects_non_object_catalogs() {
        let err = JsonPresetCatalog::from_json_str("[1, 2, 3]").unwrap_err();
        assert!(format!("{err}").contains("JSON object"));
    }

    #[test]
    fn insert_replaces_existing_entries() {
        let mut catalog = JsonPresetCatalog::builtin();
        let before = catalog.len();
        catalog.insert("Geiss - Cosmic Dust 2", PresetData(json!({ "gain": 9.0 })));

        assert_eq!(catalog.len(), before);
        assert_eq!(
            catalog.get("Geiss - Cosmic Dust 2").and_then(|p| p.param("gain")),
            Some(9.0)
        );
    }
}
