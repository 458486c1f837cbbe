//! # Container Runtime Boundary
//!
//! The engine drives containers only through the [`ContainerRuntime`] trait:
//! inspect an image's default command, manage the overlay-backed volume, run
//! a container while streaming its output, and remove leftovers.
//!
//! The shipped implementation is [`DockerCli`], which shells out to the
//! system `docker` binary. Using the CLI instead of a socket client means
//! whatever contexts, credential helpers, and daemon configuration the user
//! already has keep working.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::env::SECRETS_MOUNT;
use crate::error::{Error, Result};

/// Where the sandbox volume is mounted inside the job container.
pub const BUILD_MOUNT: &str = "/build";

/// Parameters for composing the overlay-backed sandbox volume.
#[derive(Debug)]
pub struct OverlaySpec<'a> {
    pub name: &'a str,
    /// Read-only layers, highest precedence first.
    pub lower: &'a [PathBuf],
    /// The writable layer.
    pub upper: &'a Path,
    /// Overlay scratch space, required by the mechanism.
    pub work: &'a Path,
}

/// Parameters for one container run.
#[derive(Debug)]
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub command: &'a [String],
    pub entrypoint: Option<&'a [String]>,
    pub env: &'a HashMap<String, String>,
    /// Named volume mounted read-write at [`BUILD_MOUNT`].
    pub volume: &'a str,
    /// Host directory mounted read-only at the secrets mount point.
    pub secrets_dir: &'a Path,
}

/// Operations the engine needs from a container runtime.
pub trait ContainerRuntime {
    /// The image's default boot command, used to derive the job shell.
    fn image_default_command(&self, image: &str) -> Result<Vec<String>>;

    /// Create the named overlay volume.
    fn create_volume(&self, overlay: &OverlaySpec) -> Result<()>;

    /// Force-remove a volume. Removing an absent volume is not an error.
    fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create and start a detached container, stream its combined output to
    /// `sink` in arrival order, and return its exit code once it stops.
    ///
    /// The container is left in place; callers remove it afterwards.
    fn run_streaming(&self, container: &ContainerSpec, sink: &mut dyn Write) -> Result<i64>;

    /// Force-remove a container. Removing an absent container is not an error.
    fn remove_container(&self, name: &str) -> Result<()>;
}

/// [`ContainerRuntime`] implemented over the system `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Run one docker invocation to completion, failing on a nonzero exit.
    ///
    /// `action` is a short label for error messages; the full argument list
    /// is never echoed because `-e` arguments can carry secret values.
    fn invoke(&self, action: &str, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| Error::Runtime {
                command: format!("docker {}", action),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::Runtime {
                command: format!("docker {}", action),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Like `invoke`, but an absent target counts as success.
    fn invoke_idempotent(&self, action: &str, args: &[String]) -> Result<()> {
        match self.invoke(action, args) {
            Ok(_) => Ok(()),
            Err(Error::Runtime { message, .. }) if message.to_lowercase().contains("no such") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl ContainerRuntime for DockerCli {
    fn image_default_command(&self, image: &str) -> Result<Vec<String>> {
        let output = self.invoke(
            "image inspect",
            &strings(&["image", "inspect", "--format", "{{json .Config.Cmd}}", image]),
        )?;
        let raw = String::from_utf8_lossy(&output.stdout);
        let command: Option<Vec<String>> =
            serde_json::from_str(raw.trim()).map_err(|e| Error::Runtime {
                command: "docker image inspect".to_string(),
                message: format!("unexpected inspect output: {}", e),
            })?;
        Ok(command.unwrap_or_default())
    }

    fn create_volume(&self, overlay: &OverlaySpec) -> Result<()> {
        let lower = overlay
            .lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            overlay.upper.display(),
            overlay.work.display()
        );

        let mut args = strings(&["volume", "create", "--driver", "local"]);
        for opt in ["type=overlay", "device=overlay"] {
            args.push("--opt".to_string());
            args.push(opt.to_string());
        }
        args.push("--opt".to_string());
        args.push(format!("o={}", options));
        args.push(overlay.name.to_string());

        self.invoke("volume create", &args)?;
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.invoke_idempotent("volume rm", &strings(&["volume", "rm", "--force", name]))
    }

    fn run_streaming(&self, container: &ContainerSpec, sink: &mut dyn Write) -> Result<i64> {
        let mut args = strings(&["create", "--name", container.name]);
        args.push("-v".to_string());
        args.push(format!("{}:{}", container.volume, BUILD_MOUNT));
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            container.secrets_dir.display(),
            SECRETS_MOUNT
        ));
        for (key, value) in container.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // A list-valued entrypoint override cannot be expressed directly on
        // the CLI; its head becomes --entrypoint and its tail leads the
        // command, which produces the same exec vector.
        let entrypoint_tail = match container.entrypoint {
            Some([head, tail @ ..]) => {
                args.push("--entrypoint".to_string());
                args.push(head.clone());
                tail
            }
            _ => &[],
        };

        args.push(container.image.to_string());
        args.extend(entrypoint_tail.iter().cloned());
        args.extend(container.command.iter().cloned());

        self.invoke("create", &args)?;

        // Attach before the process produces output, then forward bytes as
        // they arrive. Stderr goes straight through to the console.
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", container.name])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Runtime {
                command: "docker start".to_string(),
                message: e.to_string(),
            })?;

        if let Some(mut stdout) = child.stdout.take() {
            let mut chunk = [0u8; 8192];
            loop {
                let read = stdout.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                sink.write_all(&chunk[..read])?;
                sink.flush()?;
            }
        }
        child.wait()?;

        let output = self.invoke("wait", &strings(&["wait", container.name]))?;
        let raw = String::from_utf8_lossy(&output.stdout);
        raw.trim().parse().map_err(|_| Error::Runtime {
            command: "docker wait".to_string(),
            message: format!("unexpected exit status '{}'", raw.trim()),
        })
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.invoke_idempotent("rm", &strings(&["rm", "--force", name]))
    }
}
