//! Run command implementation
//!
//! Orchestrates one full local reproduction of a pipeline job:
//! 1. Decompose the pipeline URL and prepare the run-root layout
//! 2. Seed absent scope env stores from the pipeline registry
//! 3. Resolve the job's inheritance chain into a JobSpec
//! 4. Resolve and materialize the environment cascade
//! 5. Materialize missing dependency artifacts
//! 6. Compose the overlay sandbox and acquire the singleton slot
//! 7. Execute both script stages and mirror Stage A in the exit status

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use log::{debug, info};

use ci_replay::cache::ArtifactCache;
use ci_replay::config;
use ci_replay::env::{self, EnvCascade};
use ci_replay::error::Result as EngineResult;
use ci_replay::executor::JobExecutor;
use ci_replay::layout::{default_base_dir, RunLayout};
use ci_replay::output::OutputConfig;
use ci_replay::registry::{
    decompose_pipeline_url, GitLabRegistry, PipelineCoords, PipelineRegistry,
};
use ci_replay::runtime::DockerCli;
use ci_replay::sandbox::{SandboxSlot, SandboxVolume};

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pipeline URL, e.g. https://gitlab.example.com/group/project/-/pipelines/123
    pub pipeline: String,

    /// Name of the job to reproduce
    pub job: String,

    /// Access token for the CI instance
    #[arg(short, long, env = "CI_REPLAY_TOKEN")]
    pub token: Option<String>,

    /// Path to the CI configuration file
    #[arg(long, value_name = "PATH", default_value = ".gitlab-ci.yml")]
    pub config: PathBuf,

    /// Directory presented to the job as its workspace (defaults to the
    /// current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Tool state directory
    #[arg(long, value_name = "PATH", env = "CI_REPLAY_BASE")]
    pub base_dir: Option<PathBuf>,
}

/// Seed every absent scope store from the registry, most general first.
/// Existing stores are never rewritten.
fn seed_scope_stores(
    registry: &dyn PipelineRegistry,
    layout: &RunLayout,
    coords: &PipelineCoords,
) -> EngineResult<()> {
    let project_depth = coords.project.len();
    for (level, path) in layout.scope_env_files().iter().enumerate() {
        if path.exists() {
            continue;
        }
        let store = if level == 0 {
            registry.instance_variables()?
        } else if level == project_depth {
            registry.project_variables(&coords.project_path())?
        } else {
            registry.group_variables(&coords.project[..level].join("/"))?
        };
        debug!("seeding scope store {}", path.display());
        env::save_store(path, &store)?;
    }
    Ok(())
}

/// Execute the run command
pub fn execute(args: RunArgs, output: &OutputConfig) -> Result<ExitCode> {
    let coords = decompose_pipeline_url(&args.pipeline)?;
    info!(
        "reproducing job '{}' of pipeline {} in {}",
        args.job,
        coords.pipeline,
        coords.project_path()
    );

    let base_dir = args.base_dir.unwrap_or_else(default_base_dir);
    let layout = RunLayout::new(base_dir, &coords);
    layout.prepare()?;

    let registry = GitLabRegistry::new(&coords.instance_url, args.token);
    seed_scope_stores(&registry, &layout, &coords)?;

    let doc = config::from_file(&args.config)?;
    let job = config::resolve(&doc, &args.job)?;

    let cascade = EnvCascade::new();
    let resolved = cascade.resolve(&layout.default_env_file(), &layout.scope_env_files())?;
    let cascade_env = env::materialize(&resolved, &layout.secrets_dir())?;
    let env_vars = env::overlay_job_variables(cascade_env, &job.variables);

    let cache = ArtifactCache::new(layout.pipeline_dir());
    cache.materialize(&job.needs, &registry, &coords.project_path(), coords.pipeline)?;

    let workspace = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let volume = SandboxVolume::compose(
        &workspace,
        &layout.pipeline_dir(),
        &job.needs,
        layout.upper_dir(),
        layout.work_dir(),
    );

    let runtime = DockerCli::new();
    let mut slot = SandboxSlot::acquire(&runtime, &volume)?;
    let mut executor = JobExecutor::new(&runtime, layout.secrets_dir(), output.clone());
    let result = executor.execute(&job, &env_vars);
    slot.release();

    let outcome = result?;
    Ok(ExitCode::from(outcome.exit_code()))
}
