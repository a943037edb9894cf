//! Declarative extension modules.
//!
//! A module is a YAML manifest under `extension_modules/` naming the events
//! it wants forwarded and how. `RELOAD_MODULE` re-reads one manifest and
//! reports what changed; the daemon stays a single compiled binary, so
//! extensions declare behaviour rather than load code.

use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("extension module not found: {0}")]
    NotFound(String),

    #[error("invalid extension manifest {name}: {message}")]
    Invalid { name: String, message: String },
}

/// One extension module manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    #[serde(default = "ModuleManifest::default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Event types this module subscribes its agent to on connect.
    #[serde(default)]
    pub event_subscriptions: Vec<String>,
    #[serde(default = "ModuleManifest::default_enabled")]
    pub enabled: bool,
}

impl ModuleManifest {
    fn default_version() -> String {
        "0.1".to_string()
    }

    fn default_enabled() -> bool {
        true
    }
}

pub struct ExtensionRegistry {
    modules_dir: PathBuf,
    modules: DashMap<String, ModuleManifest>,
}

impl ExtensionRegistry {
    /// Scan `modules_dir` for manifests. A missing directory is fine:
    /// extensions are optional.
    pub fn load(modules_dir: PathBuf) -> Result<Self> {
        let registry = Self {
            modules_dir,
            modules: DashMap::new(),
        };
        let entries = match std::fs::read_dir(&registry.modules_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "failed to read extension directory {}",
                        registry.modules_dir.display()
                    )
                })
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|x| x.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            match registry.read_manifest(&name) {
                Ok(manifest) => {
                    registry.modules.insert(name, manifest);
                }
                Err(e) => tracing::warn!(module = %name, error = %e, "skipping bad manifest"),
            }
        }
        tracing::info!(count = registry.modules.len(), "loaded extension modules");
        Ok(registry)
    }

    fn read_manifest(&self, name: &str) -> Result<ModuleManifest, ExtensionError> {
        let path = self.modules_dir.join(format!("{name}.yaml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| ExtensionError::NotFound(name.to_string()))?;
        serde_yaml::from_str(&raw).map_err(|e| ExtensionError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Load or refresh one module. Returns the manifest and whether it
    /// changed relative to what was registered.
    pub fn reload(&self, name: &str) -> Result<(ModuleManifest, bool), ExtensionError> {
        let fresh = self.read_manifest(name)?;
        let changed = self
            .modules
            .get(name)
            .map(|current| *current != fresh)
            .unwrap_or(true);
        self.modules.insert(name.to_string(), fresh.clone());
        Ok((fresh, changed))
    }

    pub fn list(&self) -> Vec<ModuleManifest> {
        let mut all: Vec<ModuleManifest> = self.modules.iter().map(|m| m.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Option<ModuleManifest> {
        self.modules.get(name).map(|m| m.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_reloads_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("observer.yaml"),
            "name: observer\ndescription: watches events\nevent_subscriptions: [BROADCAST]\n",
        )
        .unwrap();

        let registry = ExtensionRegistry::load(dir.path().to_path_buf()).unwrap();
        let module = registry.get("observer").unwrap();
        assert_eq!(module.event_subscriptions, vec!["BROADCAST"]);
        assert!(module.enabled);

        // Unchanged reload reports no change.
        let (_, changed) = registry.reload("observer").unwrap();
        assert!(!changed);

        // A manifest edit is picked up.
        std::fs::write(
            dir.path().join("observer.yaml"),
            "name: observer\nevent_subscriptions: [BROADCAST, metrics]\n",
        )
        .unwrap();
        let (fresh, changed) = registry.reload("observer").unwrap();
        assert!(changed);
        assert_eq!(fresh.event_subscriptions.len(), 2);
    }

    #[test]
    fn missing_module_and_missing_dir_are_handled() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ExtensionRegistry::load(dir.path().join("nope")).unwrap();
        assert!(registry.list().is_empty());
        assert!(matches!(
            registry.reload("ghost").unwrap_err(),
            ExtensionError::NotFound(_)
        ));
    }
}
