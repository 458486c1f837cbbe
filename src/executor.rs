//! # Staged Job Execution
//!
//! Runs a resolved job inside the container runtime against the composed
//! sandbox. Execution is a small state machine:
//!
//! ```text
//! Pending -> RunningMain -> {Succeeded | Failed(code)}
//!         -> RunningAfter (only if after_script is non-empty)
//!         -> Cleanup -> Terminal
//! ```
//!
//! Stage A is `before_script` plus `script` in one container run; its exit
//! code is the run's outcome. Stage B is `after_script` in a second run whose
//! failures are reported as warnings and never change the outcome. Every
//! container run streams its output to the console as it arrives and is
//! force-removed afterwards, exit code notwithstanding.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use console::Style;
use log::warn;

use crate::config::JobSpec;
use crate::error::{Error, Result};
use crate::output::OutputConfig;
use crate::runtime::{ContainerRuntime, ContainerSpec, BUILD_MOUNT};
use crate::sandbox::{CONTAINER_NAME, VOLUME_NAME};

/// The business outcome of a run, decided by Stage A alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(i64),
}

impl Outcome {
    /// The process exit code the tool should terminate with.
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Succeeded => 0,
            Outcome::Failed(code) => (*code).clamp(1, 255) as u8,
        }
    }
}

/// Where the executor currently is in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    RunningMain,
    Succeeded,
    Failed(i64),
    RunningAfter,
    Cleanup,
    Terminal,
}

/// Build one shell script from an ordered command list.
///
/// The script aborts on the first nonzero exit, enters the build mount, and
/// echoes a colored trace line before each command. Single quotes inside a
/// command are escaped so the generated trace stays syntactically valid.
pub fn build_script(commands: &[String]) -> String {
    let mut lines = vec!["set -e".to_string(), format!("cd {}", BUILD_MOUNT)];
    for command in commands {
        let escaped = command.replace('\'', "'\\''");
        lines.push(format!("echo -e '\\e[32m$ {}\\e[0m'", escaped));
        lines.push(command.clone());
    }
    lines.join("\n")
}

/// Drives a resolved job through both stages.
pub struct JobExecutor<'r> {
    runtime: &'r dyn ContainerRuntime,
    secrets_dir: PathBuf,
    output: OutputConfig,
    state: JobState,
}

impl<'r> JobExecutor<'r> {
    pub fn new(runtime: &'r dyn ContainerRuntime, secrets_dir: PathBuf, output: OutputConfig) -> Self {
        Self {
            runtime,
            secrets_dir,
            output,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run both stages and return Stage A's outcome.
    pub fn execute(&mut self, job: &JobSpec, env: &HashMap<String, String>) -> Result<Outcome> {
        let image = job.image.reference();

        // Scripts run under the same shell the image would normally boot with.
        let default_command = self.runtime.image_default_command(image)?;
        let shell = default_command.first().cloned().ok_or_else(|| Error::Execution {
            message: format!("image '{}' has no default command to derive a shell from", image),
        })?;

        self.state = JobState::RunningMain;
        self.banner("Executing \"step_script\" stage of the job script");
        let mut stage_a: Vec<String> = job.before.clone();
        stage_a.extend(job.main.iter().cloned());
        let code = self.run_stage(&shell, &stage_a, job, env)?;

        let outcome = if code == 0 {
            Outcome::Succeeded
        } else {
            Outcome::Failed(code)
        };
        self.state = match outcome {
            Outcome::Succeeded => JobState::Succeeded,
            Outcome::Failed(code) => JobState::Failed(code),
        };

        if !job.after.is_empty() {
            self.state = JobState::RunningAfter;
            self.banner("Running after_script");
            match self.run_stage(&shell, &job.after, job, env) {
                Ok(0) => {}
                Ok(code) => {
                    warn!("after_script failed: exit code {}", code);
                    println!(
                        "{}",
                        self.output.paint(
                            &Style::new().yellow(),
                            &format!("WARNING: after_script failed: exit code {}", code),
                        )
                    );
                }
                Err(e) => warn!("after_script aborted: {}", e),
            }
        }

        self.state = JobState::Cleanup;
        match outcome {
            Outcome::Succeeded => println!(
                "{}",
                self.output.paint(&Style::new().green(), "Job succeeded")
            ),
            Outcome::Failed(code) => println!(
                "{}",
                self.output.paint(
                    &Style::new().red(),
                    &format!("ERROR: Job failed: exit code {}", code),
                )
            ),
        }
        self.state = JobState::Terminal;
        Ok(outcome)
    }

    fn banner(&self, text: &str) {
        println!("{}", self.output.paint(&Style::new().blue(), text));
        let _ = std::io::stdout().flush();
    }

    /// One container run: build the script, stream output, wait for the exit
    /// code, then force-remove the container regardless of how it went.
    fn run_stage(
        &self,
        shell: &str,
        commands: &[String],
        job: &JobSpec,
        env: &HashMap<String, String>,
    ) -> Result<i64> {
        let command = vec![shell.to_string(), "-c".to_string(), build_script(commands)];
        let spec = ContainerSpec {
            name: CONTAINER_NAME,
            image: job.image.reference(),
            command: &command,
            entrypoint: job.image.entrypoint(),
            env,
            volume: VOLUME_NAME,
            secrets_dir: &self.secrets_dir,
        };

        let result = self.runtime.run_streaming(&spec, &mut std::io::stdout());
        if let Err(e) = self.runtime.remove_container(CONTAINER_NAME) {
            warn!("container cleanup failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Image;
    use crate::runtime::OverlaySpec;
    use std::cell::RefCell;

    struct ScriptedRuntime {
        /// Exit codes handed out per container run, in order.
        codes: RefCell<Vec<i64>>,
        runs: RefCell<Vec<Vec<String>>>,
        removed: RefCell<usize>,
        default_command: Vec<String>,
    }

    impl ScriptedRuntime {
        fn new(codes: &[i64]) -> Self {
            Self {
                codes: RefCell::new(codes.to_vec()),
                runs: RefCell::new(Vec::new()),
                removed: RefCell::new(0),
                default_command: vec!["/bin/bash".to_string()],
            }
        }
    }

    impl ContainerRuntime for ScriptedRuntime {
        fn image_default_command(&self, _image: &str) -> Result<Vec<String>> {
            Ok(self.default_command.clone())
        }

        fn create_volume(&self, _overlay: &OverlaySpec) -> Result<()> {
            Ok(())
        }

        fn remove_volume(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn run_streaming(&self, container: &ContainerSpec, _sink: &mut dyn Write) -> Result<i64> {
            self.runs.borrow_mut().push(container.command.to_vec());
            Ok(self.codes.borrow_mut().remove(0))
        }

        fn remove_container(&self, _name: &str) -> Result<()> {
            *self.removed.borrow_mut() += 1;
            Ok(())
        }
    }

    fn job(before: &[&str], main: &[&str], after: &[&str]) -> JobSpec {
        JobSpec {
            before: before.iter().map(|s| s.to_string()).collect(),
            main: main.iter().map(|s| s.to_string()).collect(),
            after: after.iter().map(|s| s.to_string()).collect(),
            image: Image::Reference("img".to_string()),
            variables: HashMap::new(),
            needs: Vec::new(),
        }
    }

    #[test]
    fn test_script_traces_and_aborts_on_failure() {
        let commands = vec!["echo hi".to_string(), "echo 'q'".to_string()];
        let script = build_script(&commands);

        assert!(script.starts_with("set -e\ncd /build\n"));
        // One trace line per command, quote-escaped so the script stays valid.
        assert!(script.contains("echo -e '\\e[32m$ echo hi\\e[0m'"));
        assert!(script.contains("echo -e '\\e[32m$ echo '\\''q'\\''\\e[0m'"));
        assert!(script.contains("\necho hi\n"));
        assert!(script.ends_with("echo 'q'"));
    }

    #[test]
    fn test_successful_run() {
        let runtime = ScriptedRuntime::new(&[0]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        let outcome = executor.execute(&job(&[], &["make"], &[]), &HashMap::new()).unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(executor.state(), JobState::Terminal);
        assert_eq!(*runtime.removed.borrow(), 1);
    }

    #[test]
    fn test_stage_a_combines_before_and_main() {
        let runtime = ScriptedRuntime::new(&[0]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        executor
            .execute(&job(&["setup"], &["make"], &[]), &HashMap::new())
            .unwrap();

        let runs = runtime.runs.borrow();
        assert_eq!(runs.len(), 1);
        let script = &runs[0][2];
        let setup_at = script.find("\nsetup").unwrap();
        let make_at = script.find("\nmake").unwrap();
        assert!(setup_at < make_at);
    }

    #[test]
    fn test_shell_derived_from_image_default_command() {
        let runtime = ScriptedRuntime::new(&[0]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        executor.execute(&job(&[], &["make"], &[]), &HashMap::new()).unwrap();

        let runs = runtime.runs.borrow();
        assert_eq!(runs[0][0], "/bin/bash");
        assert_eq!(runs[0][1], "-c");
    }

    #[test]
    fn test_image_without_default_command_is_an_error() {
        let mut runtime = ScriptedRuntime::new(&[]);
        runtime.default_command = Vec::new();
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());

        let err = executor
            .execute(&job(&[], &["make"], &[]), &HashMap::new())
            .unwrap_err();
        assert!(format!("{}", err).contains("no default command"));
    }

    #[test]
    fn test_failed_main_reports_exit_code() {
        let runtime = ScriptedRuntime::new(&[3]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        let outcome = executor.execute(&job(&[], &["make"], &[]), &HashMap::new()).unwrap();

        assert_eq!(outcome, Outcome::Failed(3));
        assert_eq!(outcome.exit_code(), 3);
    }

    #[test]
    fn test_failing_after_stage_never_changes_outcome() {
        let runtime = ScriptedRuntime::new(&[0, 9]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        let outcome = executor
            .execute(&job(&[], &["make"], &["cleanup"]), &HashMap::new())
            .unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        // Both containers still get removed.
        assert_eq!(*runtime.removed.borrow(), 2);
    }

    #[test]
    fn test_after_stage_skipped_when_empty() {
        let runtime = ScriptedRuntime::new(&[0]);
        let mut executor =
            JobExecutor::new(&runtime, PathBuf::from("/secrets"), OutputConfig::without_color());
        executor.execute(&job(&[], &["make"], &[]), &HashMap::new()).unwrap();
        assert_eq!(runtime.runs.borrow().len(), 1);
    }

    #[test]
    fn test_outcome_exit_code_clamped() {
        assert_eq!(Outcome::Succeeded.exit_code(), 0);
        assert_eq!(Outcome::Failed(7).exit_code(), 7);
        assert_eq!(Outcome::Failed(512).exit_code(), 255);
    }
}
