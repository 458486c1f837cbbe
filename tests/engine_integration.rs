//! Integration tests driving the engine through its public API
//!
//! Exercises the path from configuration resolution through artifact
//! materialization and sandbox composition, with the pipeline registry
//! replaced by an in-memory fake.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use ci_replay::cache::ArtifactCache;
use ci_replay::config;
use ci_replay::env::{self, EnvCascade, EnvEntry, ScopeEnv};
use ci_replay::error::Result;
use ci_replay::registry::{PipelineJob, PipelineRegistry};
use ci_replay::sandbox::SandboxVolume;

struct FakeRegistry {
    jobs: Vec<PipelineJob>,
    archives: HashMap<u64, Vec<u8>>,
    calls: Cell<usize>,
}

impl FakeRegistry {
    fn with_artifact(job_id: u64, job_name: &str, file: &str, content: &str) -> Self {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        writer
            .start_file(file.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
        writer.finish().unwrap();

        Self {
            jobs: vec![PipelineJob {
                id: job_id,
                name: job_name.to_string(),
            }],
            archives: HashMap::from([(job_id, cursor.into_inner())]),
            calls: Cell::new(0),
        }
    }
}

impl PipelineRegistry for FakeRegistry {
    fn instance_variables(&self) -> Result<ScopeEnv> {
        Ok(ScopeEnv::new())
    }

    fn group_variables(&self, _group: &str) -> Result<ScopeEnv> {
        Ok(ScopeEnv::new())
    }

    fn project_variables(&self, _project: &str) -> Result<ScopeEnv> {
        Ok(ScopeEnv::new())
    }

    fn pipeline_jobs(&self, _project: &str, _pipeline: u64) -> Result<Vec<PipelineJob>> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.jobs.clone())
    }

    fn job_artifacts(&self, _project: &str, job_id: u64) -> Result<Vec<u8>> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.archives[&job_id].clone())
    }
}

const CI_DOC: &str = r#"
default:
  image: alpine:3.20
variables:
  PIPELINE_WIDE: "yes"
base:
  before_script:
    - apk add make
  variables:
    TIER: base
test:
  extends: base
  script:
    - make test
  needs:
    - compile
  variables:
    TIER: test
"#;

#[test]
fn test_resolution_artifacts_and_sandbox_fit_together() {
    let doc = config::parse(CI_DOC).unwrap();
    let job = config::resolve(&doc, "test").unwrap();

    assert_eq!(job.image.reference(), "alpine:3.20");
    assert_eq!(job.before, vec!["apk add make"]);
    assert_eq!(job.main, vec!["make test"]);
    assert_eq!(job.needs, vec!["compile"]);
    assert_eq!(job.variables.get("PIPELINE_WIDE").unwrap(), "yes");
    assert_eq!(job.variables.get("TIER").unwrap(), "test");

    // Materialize the one dependency into a pipeline directory.
    let tmp = TempDir::new().unwrap();
    let pipeline_dir = tmp.path().join("pipelines/7");
    std::fs::create_dir_all(&pipeline_dir).unwrap();

    let registry = FakeRegistry::with_artifact(11, "compile", "bin/app", "binary");
    let cache = ArtifactCache::new(pipeline_dir.clone());
    cache
        .materialize(&job.needs, &registry, "org/proj", 7)
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(cache.artifact_dir("compile").join("bin/app")).unwrap(),
        "binary"
    );

    // A second materialization is silent: no registry traffic at all.
    let before = registry.calls.get();
    cache
        .materialize(&job.needs, &registry, "org/proj", 7)
        .unwrap();
    assert_eq!(registry.calls.get(), before);

    // The sandbox layers the workspace above the dependency's output.
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let volume = SandboxVolume::compose(
        &workspace,
        &pipeline_dir,
        &job.needs,
        tmp.path().join("upper"),
        tmp.path().join("work"),
    );
    assert_eq!(
        volume.lower_layers(),
        [workspace, pipeline_dir.join("compile")]
    );
}

#[test]
fn test_cascade_feeds_job_environment() {
    let tmp = TempDir::new().unwrap();

    let default_store = tmp.path().join("env.json");
    env::save_store(
        &default_store,
        &ScopeEnv::from([("FOO".to_string(), EnvEntry::variable("default"))]),
    )
    .unwrap();

    let project_store = tmp.path().join("project/env.json");
    env::save_store(
        &project_store,
        &ScopeEnv::from([
            ("FOO".to_string(), EnvEntry::variable("project")),
            ("DEPLOY_KEY".to_string(), EnvEntry::file("-----KEY-----")),
        ]),
    )
    .unwrap();

    let cascade = EnvCascade::new();
    let resolved = cascade
        .resolve(&default_store, &[project_store])
        .unwrap();

    let secrets = tmp.path().join("secrets");
    std::fs::create_dir_all(&secrets).unwrap();
    let materialized = env::materialize(&resolved, &secrets).unwrap();
    assert_eq!(materialized.get("FOO").unwrap(), "project");
    assert_eq!(materialized.get("DEPLOY_KEY").unwrap(), "/env/DEPLOY_KEY");
    assert_eq!(
        std::fs::read_to_string(secrets.join("DEPLOY_KEY")).unwrap(),
        "-----KEY-----"
    );

    // Job-declared variables outrank everything the cascade produced.
    let job_vars = HashMap::from([("FOO".to_string(), "job".to_string())]);
    let final_env = env::overlay_job_variables(materialized, &job_vars);
    assert_eq!(final_env.get("FOO").unwrap(), "job");
}

#[test]
fn test_workspace_shadowing_layer_order() {
    // Identical relative paths resolve to the earliest lower layer; the
    // compose order encodes that the workspace wins over any dependency.
    let volume = SandboxVolume::compose(
        std::path::Path::new("/workspace"),
        std::path::Path::new("/pipeline"),
        &["first".to_string(), "second".to_string()],
        PathBuf::from("/upper"),
        PathBuf::from("/work"),
    );
    let layers = volume.lower_layers();
    assert_eq!(layers[0], PathBuf::from("/workspace"));
    assert!(
        layers.iter().position(|p| p.ends_with("first")).unwrap()
            < layers.iter().position(|p| p.ends_with("second")).unwrap()
    );
}
