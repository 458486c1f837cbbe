//! # Persisted Run-Root Layout
//!
//! Everything ci-replay keeps on disk lives under one base directory:
//!
//! ```text
//! <base>/work                          overlay scratch, reset each run
//! <base>/run                           overlay upper layer, reset each run
//! <base>/secrets                       materialized file secrets, reset each run
//! <base>/env.json                      process-wide default env store
//! <base>/instance/<host>/env.json      instance-level env store
//! <base>/instance/<host>/<g1>/.../env.json   one store per group prefix
//! <base>/instance/<host>/<g1>/.../<proj>/pipelines/<id>/<job>/   artifact dirs
//! ```
//!
//! Env stores and artifact directories persist across runs; the scratch,
//! upper, and secrets areas are wiped at the start of every invocation.

use std::path::{Path, PathBuf};

use crate::env::{save_store, ScopeEnv};
use crate::error::Result;
use crate::registry::PipelineCoords;

/// Name of the per-scope environment document.
const ENV_FILE: &str = "env.json";

/// The default tool base directory.
pub fn default_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ci-replay")
}

/// Resolved paths of one run, anchored at the tool base directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    base: PathBuf,
    instance: String,
    project: Vec<String>,
    pipeline: u64,
}

impl RunLayout {
    pub fn new(base: PathBuf, coords: &PipelineCoords) -> Self {
        Self {
            base,
            instance: coords.instance_name.clone(),
            project: coords.project.clone(),
            pipeline: coords.pipeline,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Overlay scratch directory.
    pub fn work_dir(&self) -> PathBuf {
        self.base.join("work")
    }

    /// Overlay upper (writable) layer.
    pub fn upper_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    /// Per-run directory holding materialized file secrets.
    pub fn secrets_dir(&self) -> PathBuf {
        self.base.join("secrets")
    }

    /// The process-wide default env store.
    pub fn default_env_file(&self) -> PathBuf {
        self.base.join(ENV_FILE)
    }

    fn instance_dir(&self) -> PathBuf {
        self.base.join("instance").join(&self.instance)
    }

    fn project_dir(&self) -> PathBuf {
        let mut dir = self.instance_dir();
        for component in &self.project {
            dir = dir.join(component);
        }
        dir
    }

    /// Where this run's pipeline artifacts live, one directory per job.
    pub fn pipeline_dir(&self) -> PathBuf {
        self.project_dir()
            .join("pipelines")
            .join(self.pipeline.to_string())
    }

    /// Scope env store files from least to most specific: the instance
    /// store, one per group prefix, then the project store.
    pub fn scope_env_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(self.project.len() + 1);
        let mut dir = self.instance_dir();
        files.push(dir.join(ENV_FILE));
        for component in &self.project {
            dir = dir.join(component);
            files.push(dir.join(ENV_FILE));
        }
        files
    }

    /// Create the run-root tree, wiping the per-run areas and seeding an
    /// empty default env store on first use.
    pub fn prepare(&self) -> Result<()> {
        for dir in [self.work_dir(), self.upper_dir(), self.secrets_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            std::fs::create_dir_all(&dir)?;
        }

        let default_env = self.default_env_file();
        if !default_env.exists() {
            save_store(&default_env, &ScopeEnv::new())?;
        }

        std::fs::create_dir_all(self.pipeline_dir())?;
        Ok(())
    }
}
