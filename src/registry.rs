//! # Pipeline Registry Boundary
//!
//! The pipeline registry is the remote side of a run: the service that knows
//! the scope variables, the pipeline's jobs, and their artifact archives.
//! The engine only talks to it through the [`PipelineRegistry`] trait; the
//! shipped implementation is [`GitLabRegistry`] over the GitLab v4 REST API.
//!
//! This module also owns pipeline URL decomposition, which turns a pasted
//! pipeline web URL into the instance, project path, and pipeline id.

use serde::Deserialize;
use url::Url;

use crate::env::{EnvEntry, EnvKind, ScopeEnv};
use crate::error::{Error, Result};

/// Coordinates extracted from a pipeline web URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCoords {
    /// Scheme plus authority, e.g. `https://gitlab.example.com`.
    pub instance_url: String,
    /// The authority alone, used as the instance directory name.
    pub instance_name: String,
    /// Group path components followed by the project name.
    pub project: Vec<String>,
    /// The numeric pipeline id.
    pub pipeline: u64,
}

impl PipelineCoords {
    /// The project's full namespaced path, `group/subgroup/project`.
    pub fn project_path(&self) -> String {
        self.project.join("/")
    }
}

/// Decompose a pipeline web URL of the form
/// `https://host/group/.../project/-/pipelines/<id>`.
///
/// A scheme-less URL is assumed to be HTTPS. The `/-/` separator is optional,
/// matching older GitLab URL layouts.
pub fn decompose_pipeline_url(raw: &str) -> Result<PipelineCoords> {
    let normalized = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let url = Url::parse(&normalized)?;

    let bad_shape = || Error::ConfigParse {
        message: format!("'{}' is not a pipeline URL", raw),
        hint: Some("expected https://host/group/project/-/pipelines/<id>".to_string()),
    };

    let host = url.host_str().ok_or_else(|| bad_shape())?;
    let instance_name = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let instance_url = format!("{}://{}", url.scheme(), instance_name);

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    if segments.len() < 3 || segments[segments.len() - 2] != "pipelines" {
        return Err(bad_shape());
    }
    let pipeline: u64 = segments[segments.len() - 1].parse().map_err(|_| bad_shape())?;

    let mut project: Vec<String> = segments[..segments.len() - 2]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if project.last().map(String::as_str) == Some("-") {
        project.pop();
    }
    if project.is_empty() {
        return Err(bad_shape());
    }

    Ok(PipelineCoords {
        instance_url,
        instance_name,
        project,
        pipeline,
    })
}

/// One job listed in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipelineJob {
    pub id: u64,
    pub name: String,
}

/// Remote operations the engine needs from the CI service.
pub trait PipelineRegistry {
    /// Instance-level CI variables.
    fn instance_variables(&self) -> Result<ScopeEnv>;
    /// Variables of one group, addressed by its full namespaced path.
    fn group_variables(&self, group: &str) -> Result<ScopeEnv>;
    /// Variables of one project, addressed by its full namespaced path.
    fn project_variables(&self, project: &str) -> Result<ScopeEnv>;
    /// All jobs of one pipeline.
    fn pipeline_jobs(&self, project: &str, pipeline: u64) -> Result<Vec<PipelineJob>>;
    /// A job's artifact archive as raw zip bytes.
    fn job_artifacts(&self, project: &str, job_id: u64) -> Result<Vec<u8>>;
}

/// A CI variable as the REST API reports it.
#[derive(Debug, Deserialize)]
struct RestVariable {
    key: String,
    value: String,
    #[serde(default)]
    variable_type: Option<String>,
}

impl From<RestVariable> for EnvEntry {
    fn from(var: RestVariable) -> Self {
        let kind = if var.variable_type.as_deref() == Some("file") {
            EnvKind::FileMounted
        } else {
            EnvKind::Variable
        };
        EnvEntry {
            value: var.value,
            kind,
        }
    }
}

/// Percent-encode a namespaced path for use as a REST id.
///
/// GitLab path components are restricted to letters, digits, `_`, `-` and
/// `.`, so only the separators need encoding.
fn encode_path(path: &str) -> String {
    path.replace('/', "%2F")
}

const PER_PAGE: usize = 100;

/// [`PipelineRegistry`] over the GitLab v4 REST API.
pub struct GitLabRegistry {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl GitLabRegistry {
    pub fn new(instance_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: format!("{}/api/v4", instance_url.trim_end_matches('/')),
            token,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(Error::Registry {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        Ok(response)
    }

    /// Fetch every page of a list endpoint.
    fn get_paged<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}{}?per_page={}&page={}",
                self.base_url, path, PER_PAGE, page
            );
            let batch: Vec<T> = self.get(&url)?.json()?;
            let last_page = batch.len() < PER_PAGE;
            items.extend(batch);
            if last_page {
                return Ok(items);
            }
            page += 1;
        }
    }

    fn variables_at(&self, path: &str) -> Result<ScopeEnv> {
        let raw: Vec<RestVariable> = self.get_paged(path)?;
        Ok(raw
            .into_iter()
            .map(|var| (var.key.clone(), EnvEntry::from(var)))
            .collect())
    }
}

impl PipelineRegistry for GitLabRegistry {
    fn instance_variables(&self) -> Result<ScopeEnv> {
        self.variables_at("/admin/ci/variables")
    }

    fn group_variables(&self, group: &str) -> Result<ScopeEnv> {
        self.variables_at(&format!("/groups/{}/variables", encode_path(group)))
    }

    fn project_variables(&self, project: &str) -> Result<ScopeEnv> {
        self.variables_at(&format!("/projects/{}/variables", encode_path(project)))
    }

    fn pipeline_jobs(&self, project: &str, pipeline: u64) -> Result<Vec<PipelineJob>> {
        self.get_paged(&format!(
            "/projects/{}/pipelines/{}/jobs",
            encode_path(project),
            pipeline
        ))
    }

    fn job_artifacts(&self, project: &str, job_id: u64) -> Result<Vec<u8>> {
        let url = format!(
            "{}/projects/{}/jobs/{}/artifacts",
            self.base_url,
            encode_path(project),
            job_id
        );
        let bytes = self.get(&url)?.bytes()?;
        Ok(bytes.to_vec())
    }
}
