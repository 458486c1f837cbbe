//! # Environment Variable Cascade
//!
//! Scope environment stores hold the secrets and variables a hosted runner
//! would inject. There is one JSON document per hierarchy level: a
//! process-wide default store, then the instance, then each group prefix of
//! the project path, then the project itself. For any key, the most specific
//! store that defines it wins.
//!
//! Stores are loaded lazily and cached for the process lifetime; the engine
//! never rewrites them, it only seeds absent ones from the pipeline registry.
//!
//! File-typed entries are materialized into a per-run secrets directory and
//! exposed to the job as a fixed in-container path instead of their raw value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where the secrets directory is mounted inside the job container.
pub const SECRETS_MOUNT: &str = "/env";

/// How an environment entry is delivered to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvKind {
    /// Exposed literally as an environment variable.
    #[serde(rename = "env_var")]
    Variable,
    /// Written to a file; the variable carries the file's path.
    #[serde(rename = "file")]
    FileMounted,
}

/// One environment definition inside a scope store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: EnvKind,
}

impl EnvEntry {
    pub fn variable(value: &str) -> Self {
        Self {
            value: value.to_string(),
            kind: EnvKind::Variable,
        }
    }

    pub fn file(value: &str) -> Self {
        Self {
            value: value.to_string(),
            kind: EnvKind::FileMounted,
        }
    }
}

/// One scope level's definitions, keyed by variable name.
pub type ScopeEnv = HashMap<String, EnvEntry>;

/// Load a scope store document. A missing file is an empty store; a
/// malformed one is an error.
pub fn load_store(path: &Path) -> Result<ScopeEnv> {
    if !path.exists() {
        return Ok(ScopeEnv::new());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| Error::EnvLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Write a scope store document, creating parent directories as needed.
pub fn save_store(path: &Path, store: &ScopeEnv) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string(store)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Resolves the scope hierarchy into one flat environment.
///
/// Each store file is read at most once per process; repeated resolutions
/// reuse the cached copy.
#[derive(Debug, Clone, Default)]
pub struct EnvCascade {
    stores: Arc<Mutex<HashMap<PathBuf, ScopeEnv>>>,
}

impl EnvCascade {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, path: &Path) -> Result<ScopeEnv> {
        let mut stores = self.stores.lock().map_err(|_| Error::LockPoisoned {
            context: "env store cache".to_string(),
        })?;
        if let Some(cached) = stores.get(path) {
            return Ok(cached.clone());
        }
        let loaded = load_store(path)?;
        stores.insert(path.to_path_buf(), loaded.clone());
        Ok(loaded)
    }

    /// Fold the scope hierarchy, least specific first, into one resolved map.
    ///
    /// `scope_paths` must be ordered from least to most specific; the default
    /// store sits below all of them.
    pub fn resolve(&self, default_store: &Path, scope_paths: &[PathBuf]) -> Result<ScopeEnv> {
        let mut resolved = self.store(default_store)?;
        for path in scope_paths {
            resolved.extend(self.store(path)?);
        }
        Ok(resolved)
    }
}

/// Turn a resolved scope environment into the flat map handed to the
/// container, writing file-typed entries into `secrets_dir`.
///
/// A file entry named `KEY` lands at `<secrets_dir>/KEY` on the host and is
/// exposed to the job as `/env/KEY`, where the secrets directory is mounted.
pub fn materialize(resolved: &ScopeEnv, secrets_dir: &Path) -> Result<HashMap<String, String>> {
    let mut env_vars = HashMap::new();
    for (key, entry) in resolved {
        match entry.kind {
            EnvKind::FileMounted => {
                std::fs::write(secrets_dir.join(key), &entry.value)?;
                env_vars.insert(key.clone(), format!("{}/{}", SECRETS_MOUNT, key));
            }
            EnvKind::Variable => {
                env_vars.insert(key.clone(), entry.value.clone());
            }
        }
    }
    Ok(env_vars)
}

/// Overlay the job's own variable declarations onto the cascade result.
/// Job-declared values always win.
pub fn overlay_job_variables(
    mut cascade: HashMap<String, String>,
    job_variables: &HashMap<String, String>,
) -> HashMap<String, String> {
    for (key, value) in job_variables {
        cascade.insert(key.clone(), value.clone());
    }
    cascade
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_store(dir: &Path, name: &str, entries: &[(&str, EnvEntry)]) -> PathBuf {
        let path = dir.join(name);
        let store: ScopeEnv = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        save_store(&path, &store).unwrap();
        path
    }

    #[test]
    fn test_most_specific_scope_wins() {
        let tmp = TempDir::new().unwrap();
        let default = write_store(tmp.path(), "default.json", &[("FOO", EnvEntry::variable("1"))]);
        let instance = write_store(tmp.path(), "instance.json", &[("FOO", EnvEntry::variable("2"))]);
        let project = write_store(tmp.path(), "project.json", &[("FOO", EnvEntry::variable("3"))]);

        let cascade = EnvCascade::new();
        let resolved = cascade
            .resolve(&default, &[instance.clone(), project])
            .unwrap();
        assert_eq!(resolved.get("FOO").unwrap().value, "3");

        // Dropping the project level falls back to the instance value.
        let cascade = EnvCascade::new();
        let resolved = cascade.resolve(&default, &[instance]).unwrap();
        assert_eq!(resolved.get("FOO").unwrap().value, "2");
    }

    #[test]
    fn test_default_store_supplies_missing_keys() {
        let tmp = TempDir::new().unwrap();
        let default = write_store(
            tmp.path(),
            "default.json",
            &[("ONLY_DEFAULT", EnvEntry::variable("d"))],
        );
        let project = write_store(tmp.path(), "project.json", &[("FOO", EnvEntry::variable("p"))]);

        let cascade = EnvCascade::new();
        let resolved = cascade.resolve(&default, &[project]).unwrap();
        assert_eq!(resolved.get("ONLY_DEFAULT").unwrap().value, "d");
        assert_eq!(resolved.get("FOO").unwrap().value, "p");
    }

    #[test]
    fn test_missing_store_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = load_store(&tmp.path().join("absent.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_malformed_store_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("env.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_store(&path).unwrap_err();
        assert!(matches!(err, Error::EnvLoad { .. }));
    }

    #[test]
    fn test_store_document_format() {
        let tmp = TempDir::new().unwrap();
        let path = write_store(
            tmp.path(),
            "env.json",
            &[("TOKEN", EnvEntry::file("secret")), ("MODE", EnvEntry::variable("ci"))],
        );
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["TOKEN"]["type"], "file");
        assert_eq!(raw["TOKEN"]["value"], "secret");
        assert_eq!(raw["MODE"]["type"], "env_var");
    }

    #[test]
    fn test_stores_cached_per_process() {
        let tmp = TempDir::new().unwrap();
        let default = write_store(tmp.path(), "default.json", &[("FOO", EnvEntry::variable("1"))]);

        let cascade = EnvCascade::new();
        assert_eq!(
            cascade.resolve(&default, &[]).unwrap().get("FOO").unwrap().value,
            "1"
        );

        // Rewriting the file on disk is not observed within the same process.
        write_store(tmp.path(), "default.json", &[("FOO", EnvEntry::variable("changed"))]);
        assert_eq!(
            cascade.resolve(&default, &[]).unwrap().get("FOO").unwrap().value,
            "1"
        );
    }

    #[test]
    fn test_materialize_file_entries() {
        let tmp = TempDir::new().unwrap();
        let mut resolved = ScopeEnv::new();
        resolved.insert("PLAIN".to_string(), EnvEntry::variable("literal"));
        resolved.insert("KEYFILE".to_string(), EnvEntry::file("-----KEY-----"));

        let env_vars = materialize(&resolved, tmp.path()).unwrap();
        assert_eq!(env_vars.get("PLAIN").unwrap(), "literal");
        assert_eq!(env_vars.get("KEYFILE").unwrap(), "/env/KEYFILE");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("KEYFILE")).unwrap(),
            "-----KEY-----"
        );
    }

    #[test]
    fn test_job_variables_win_over_cascade() {
        let mut cascade = HashMap::new();
        cascade.insert("FOO".to_string(), "from-cascade".to_string());
        cascade.insert("KEEP".to_string(), "kept".to_string());

        let mut job_vars = HashMap::new();
        job_vars.insert("FOO".to_string(), "from-job".to_string());

        let merged = overlay_job_variables(cascade, &job_vars);
        assert_eq!(merged.get("FOO").unwrap(), "from-job");
        assert_eq!(merged.get("KEEP").unwrap(), "kept");
    }
}
