//! # ci-replay Library
//!
//! This library reproduces a single CI pipeline job on the local machine the
//! way a hosted runner would execute it. It is used by the `ci-replay`
//! command-line tool but the engine is usable on its own.
//!
//! ## Core Concepts
//!
//! - **Configuration resolution (`config`)**: flattens a job's `extends`
//!   inheritance chain from `.gitlab-ci.yml` into one concrete [`config::JobSpec`].
//! - **Environment cascade (`env`)**: merges scope environment stores
//!   (default, instance, group prefixes, project) into one resolved map and
//!   materializes file-backed secrets.
//! - **Artifact cache (`cache`)**: fetches the artifacts of jobs named in
//!   `needs`, downloading only what is missing locally.
//! - **Sandbox (`sandbox`)**: composes an overlay filesystem from the
//!   workspace and dependency artifacts, with a private writable layer, and
//!   owns the host's singleton sandbox identity.
//! - **Execution (`executor`)**: runs the job's script stages in containers,
//!   streaming output and deciding the run outcome.
//! - **Collaborator boundaries (`registry`, `runtime`)**: the remote CI
//!   service and the container engine, each behind a trait with one shipped
//!   implementation.
//!
//! ## Execution Flow
//!
//! 1. Decompose the pipeline URL and prepare the run-root layout.
//! 2. Seed absent scope env stores from the pipeline registry.
//! 3. Resolve the target job's configuration.
//! 4. Resolve and materialize the environment cascade, then overlay the
//!    job's own variables.
//! 5. Materialize missing dependency artifacts.
//! 6. Acquire the sandbox slot and compose the overlay volume.
//! 7. Execute the job stages and release the slot.

pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod layout;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod sandbox;
