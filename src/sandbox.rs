//! # Sandbox Composition
//!
//! The sandbox is an overlay filesystem presented to the job container at
//! one fixed mount point: the real workspace and each dependency's artifact
//! directory as read-only lower layers, plus a writable upper layer that
//! absorbs every write the job makes. On path collisions the workspace
//! shadows any dependency, and an earlier dependency shadows a later one.
//!
//! The composed volume and the execution container carry fixed names, so at
//! most one invocation can run per host. [`SandboxSlot`] owns that singleton:
//! acquiring it reclaims whatever a crashed prior run left behind, and
//! releasing it removes the volume again, best-effort.

use std::path::{Path, PathBuf};

use log::warn;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, OverlaySpec};

/// Fixed name of the composed sandbox volume.
pub const VOLUME_NAME: &str = "ci-replay-volume";

/// Fixed name of the execution container.
pub const CONTAINER_NAME: &str = "ci-replay-job";

/// The layer set of one run's sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxVolume {
    lower: Vec<PathBuf>,
    upper: PathBuf,
    work: PathBuf,
}

impl SandboxVolume {
    /// Compose the layer list: the workspace first, then each need's
    /// artifact directory in declared order.
    pub fn compose(
        workspace: &Path,
        pipeline_dir: &Path,
        needs: &[String],
        upper: PathBuf,
        work: PathBuf,
    ) -> Self {
        let mut lower = vec![workspace.to_path_buf()];
        lower.extend(needs.iter().map(|need| pipeline_dir.join(need)));
        Self { lower, upper, work }
    }

    /// Read-only layers, highest precedence first.
    pub fn lower_layers(&self) -> &[PathBuf] {
        &self.lower
    }

    fn overlay_spec(&self) -> OverlaySpec<'_> {
        OverlaySpec {
            name: VOLUME_NAME,
            lower: &self.lower,
            upper: &self.upper,
            work: &self.work,
        }
    }
}

/// Exclusive hold on the host's single sandbox identity.
pub struct SandboxSlot<'r> {
    runtime: &'r dyn ContainerRuntime,
    held: bool,
}

impl<'r> SandboxSlot<'r> {
    /// Reclaim any stale container and volume left by an abnormal prior
    /// termination, then create the volume for this run.
    pub fn acquire(runtime: &'r dyn ContainerRuntime, volume: &SandboxVolume) -> Result<Self> {
        if let Err(e) = runtime.remove_container(CONTAINER_NAME) {
            warn!("could not reclaim stale container: {}", e);
        }
        if let Err(e) = runtime.remove_volume(VOLUME_NAME) {
            warn!("could not reclaim stale volume: {}", e);
        }

        runtime.create_volume(&volume.overlay_spec())?;
        Ok(Self {
            runtime,
            held: true,
        })
    }

    /// Remove the container and volume. Failures are warnings; they never
    /// override the run outcome.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = self.runtime.remove_container(CONTAINER_NAME) {
            warn!("container cleanup failed: {}", e);
        }
        if let Err(e) = self.runtime.remove_volume(VOLUME_NAME) {
            warn!("volume cleanup failed: {}", e);
        }
    }
}

impl Drop for SandboxSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
