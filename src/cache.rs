//! # Dependency Artifact Cache
//!
//! Each `needs` entry maps to one artifact directory under the pipeline's
//! directory. A directory is complete only once it carries the completion
//! marker, which is written into a staging directory after a full extraction
//! and published together with it by an atomic rename. An unmarked directory
//! is an interrupted extraction and gets discarded and refetched.
//!
//! Materialization is idempotent: when every need is already complete, no
//! registry call is made at all. Otherwise the pipeline's job list is fetched
//! once and only the missing subset is downloaded, so a complete directory
//! is never extracted over.

use std::io::Cursor;
use std::path::PathBuf;

use log::{debug, info};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::registry::{PipelineJob, PipelineRegistry};

/// Marker file present only in fully extracted artifact directories.
pub const COMPLETE_MARKER: &str = ".complete";

/// Materializes dependency artifacts into one pipeline directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    pipeline_dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(pipeline_dir: PathBuf) -> Self {
        Self { pipeline_dir }
    }

    /// The artifact directory of one job.
    pub fn artifact_dir(&self, job: &str) -> PathBuf {
        self.pipeline_dir.join(job)
    }

    /// Whether a job's artifacts are fully materialized.
    pub fn is_complete(&self, job: &str) -> bool {
        self.artifact_dir(job).join(COMPLETE_MARKER).is_file()
    }

    /// Ensure every need's artifact directory exists and is complete.
    pub fn materialize(
        &self,
        needs: &[String],
        registry: &dyn PipelineRegistry,
        project: &str,
        pipeline: u64,
    ) -> Result<()> {
        let missing: Vec<&String> = needs.iter().filter(|need| !self.is_complete(need)).collect();
        if missing.is_empty() {
            debug!("all {} dependency artifacts already cached", needs.len());
            return Ok(());
        }

        let jobs = registry.pipeline_jobs(project, pipeline)?;
        for need in missing {
            let job = jobs
                .iter()
                .find(|job| &job.name == need)
                .ok_or_else(|| Error::ArtifactFetch {
                    job: need.clone(),
                    message: format!("not present in pipeline {}", pipeline),
                })?;
            info!("fetching artifacts of job '{}' (id {})", job.name, job.id);
            self.fetch(registry, project, job)?;
        }
        Ok(())
    }

    /// Download and extract one job's archive, publishing it atomically.
    fn fetch(
        &self,
        registry: &dyn PipelineRegistry,
        project: &str,
        job: &PipelineJob,
    ) -> Result<()> {
        let target = self.artifact_dir(&job.name);
        if target.exists() {
            if target.join(COMPLETE_MARKER).is_file() {
                // Only the missing subset may be fetched; extracting over a
                // complete directory would silently merge old and new output.
                return Err(Error::ArtifactFetch {
                    job: job.name.clone(),
                    message: "already materialized; refusing to extract over it".to_string(),
                });
            }
            debug!("discarding interrupted extraction for '{}'", job.name);
            std::fs::remove_dir_all(&target)?;
        }

        let bytes = registry.job_artifacts(project, job.id)?;
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::ArtifactFetch {
                job: job.name.clone(),
                message: format!("invalid artifact archive: {}", e),
            })?;

        let staging = self.pipeline_dir.join(format!(".staging-{}", job.name));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        archive.extract(&staging).map_err(|e| Error::ArtifactFetch {
            job: job.name.clone(),
            message: format!("extraction failed: {}", e),
        })?;

        std::fs::write(staging.join(COMPLETE_MARKER), b"")?;
        std::fs::rename(&staging, &target)?;
        Ok(())
    }
}
