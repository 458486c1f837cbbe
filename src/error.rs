//! # Error Handling
//!
//! Centralized error handling for the `ci-replay` application, built on
//! `thiserror`. Each variant corresponds to one failure domain of the run
//! pipeline and carries enough context to point at the offending job,
//! scope document, or external command.
//!
//! Errors raised before any container starts abort the run; a nonzero exit
//! code from the job's own script is a business outcome, never an `Error`.

use thiserror::Error;

/// Main error type for ci-replay operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error occurred while interpreting the CI configuration document.
    ///
    /// Includes the specific issue and optionally a hint about how to fix it.
    #[error("Configuration error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    ConfigParse {
        message: String,
        /// Optional hint for how to fix the configuration issue
        hint: Option<String>,
    },

    /// A circular reference was detected in a job's `extends` chain.
    #[error("Cycle detected in job inheritance: {cycle}")]
    CycleDetected { cycle: String },

    /// A scope environment document could not be loaded.
    #[error("Environment store error for {path}: {message}")]
    EnvLoad { path: String, message: String },

    /// A dependency artifact could not be materialized.
    #[error("Artifact error for job '{job}': {message}")]
    ArtifactFetch { job: String, message: String },

    /// An error occurred while composing or reclaiming the sandbox.
    #[error("Sandbox error: {message}")]
    Sandbox { message: String },

    /// A container runtime invocation failed.
    #[error("Container runtime error: {command} - {message}")]
    Runtime { command: String, message: String },

    /// An error occurred while driving the job's container execution.
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// The pipeline registry rejected or failed a request.
    #[error("Registry error for {url}: {message}")]
    Registry { url: String, message: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON parsing error, wrapped from `serde_json::Error`.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL parsing error, wrapped from `url::ParseError`.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// An HTTP transport error, wrapped from `reqwest::Error`.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An archive error, wrapped from `zip::result::ZipError`.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
