//! # CI Configuration Resolution
//!
//! This module flattens a job's inheritance chain from a parsed
//! `.gitlab-ci.yml` document into one concrete [`JobSpec`]. The document is a
//! generic YAML mapping of job-name to job-mapping, with an optional global
//! `default` job and an optional global `variables` mapping.
//!
//! ## Resolution
//!
//! `resolve` walks the `extends` chain depth-first. Parents contribute in
//! declared order, the job's own mapping wins last, and when resolving the
//! target job itself (the root) the global `default` job is treated as an
//! implicit first parent and the global `variables` mapping seeds the result.
//! A job that declares no `extends` at all is returned untouched, even at the
//! root, so it never picks up the global default or global variables. That
//! asymmetry is long-standing observed behavior and is preserved on purpose.
//!
//! ## Merge rule
//!
//! Two rules only, applied key-wise in fold order:
//!
//! 1. A mapping value shallow-merges into the existing mapping under that key
//!    (key-wise union, the update wins per key). This is how `variables`
//!    accumulate across the whole chain.
//! 2. Any other value (scalar or sequence) overwrites the key entirely, so
//!    fields like `script` and `image` follow strict last-writer-wins.

use std::collections::HashMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// The container image a job runs under.
///
/// The CI schema allows either a bare reference string or a structured
/// mapping carrying a reference plus an entrypoint override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Image {
    /// A plain image reference, e.g. `alpine:3.20`.
    Reference(String),
    /// A reference with an entrypoint override command.
    WithEntrypoint {
        name: String,
        entrypoint: Vec<String>,
    },
}

impl Image {
    /// The bare image reference, regardless of variant.
    pub fn reference(&self) -> &str {
        match self {
            Image::Reference(name) => name,
            Image::WithEntrypoint { name, .. } => name,
        }
    }

    /// The entrypoint override, if one was declared.
    pub fn entrypoint(&self) -> Option<&[String]> {
        match self {
            Image::Reference(_) => None,
            Image::WithEntrypoint { entrypoint, .. } => Some(entrypoint),
        }
    }
}

/// A fully resolved job, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// Commands run before the main script, in the same container run.
    pub before: Vec<String>,
    /// The main script commands. Required and non-empty after resolution.
    pub main: Vec<String>,
    /// Commands run after the main stage, in a separate container run.
    pub after: Vec<String>,
    /// The image the job executes under.
    pub image: Image,
    /// Job-level variables. These outrank every cascade-derived value.
    pub variables: HashMap<String, String>,
    /// Names of jobs whose artifacts this job depends on, in declared order.
    pub needs: Vec<String>,
}

/// Parse a CI configuration document from a YAML string.
pub fn parse(content: &str) -> Result<Mapping> {
    let doc: Mapping = serde_yaml::from_str(content)?;
    Ok(doc)
}

/// Load and parse a CI configuration document from a file.
pub fn from_file(path: &Path) -> Result<Mapping> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigParse {
        message: format!("cannot read {}: {}", path.display(), e),
        hint: Some("run ci-replay from the repository root, or pass --config".to_string()),
    })?;
    parse(&content)
}

/// Resolve the named job's inheritance chain into a [`JobSpec`].
pub fn resolve(doc: &Mapping, job_name: &str) -> Result<JobSpec> {
    let job = doc
        .get(job_name)
        .and_then(Value::as_mapping)
        .ok_or_else(|| Error::ConfigParse {
            message: format!("job '{}' not found in configuration", job_name),
            hint: Some("check the job name against .gitlab-ci.yml".to_string()),
        })?;

    let mut visited = vec![job_name.to_string()];
    let flat = flatten(doc, job, true, &mut visited)?;
    extract(job_name, &flat)
}

/// Normalize an `extends` declaration into an ordered list of parent names.
fn extends_list(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(name) => Ok(vec![name.clone()]),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| Error::ConfigParse {
                    message: "extends entries must be job names".to_string(),
                    hint: None,
                })
            })
            .collect(),
        _ => Err(Error::ConfigParse {
            message: "extends must be a job name or a list of job names".to_string(),
            hint: None,
        }),
    }
}

/// Recursively flatten a job mapping over its parents.
///
/// `visited` holds the active resolution path and is how a cyclic `extends`
/// chain becomes a [`Error::CycleDetected`] instead of unbounded recursion.
fn flatten(doc: &Mapping, job: &Mapping, root: bool, visited: &mut Vec<String>) -> Result<Mapping> {
    // No extends: the mapping passes through untouched, even at the root.
    let Some(extends) = job.get("extends") else {
        return Ok(job.clone());
    };

    let mut parents = extends_list(extends)?;
    if root && doc.get("default").is_some() {
        parents.insert(0, "default".to_string());
    }

    let mut flat = Mapping::new();
    if root {
        if let Some(globals) = doc.get("variables") {
            if globals.is_mapping() {
                flat.insert(Value::String("variables".to_string()), globals.clone());
            }
        }
    }

    for parent in &parents {
        if visited.iter().any(|seen| seen == parent) {
            let mut cycle = visited.clone();
            cycle.push(parent.clone());
            return Err(Error::CycleDetected {
                cycle: cycle.join(" -> "),
            });
        }

        let parent_job = doc
            .get(parent.as_str())
            .and_then(Value::as_mapping)
            .ok_or_else(|| Error::ConfigParse {
                message: format!("extends references unknown job '{}'", parent),
                hint: Some("every extends target must be a job mapping in the same document".to_string()),
            })?;

        visited.push(parent.clone());
        let resolved = flatten(doc, parent_job, false, visited)?;
        visited.pop();

        merge_into(&mut flat, &resolved);
    }

    merge_into(&mut flat, job);
    Ok(flat)
}

/// Fold `update` into `base`: mappings union key-wise, everything else
/// overwrites. The `extends` key never survives into the output.
fn merge_into(base: &mut Mapping, update: &Mapping) {
    for (key, value) in update {
        if key.as_str() == Some("extends") {
            continue;
        }

        match value {
            Value::Mapping(patch) => {
                let slot = base
                    .entry(key.clone())
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if !slot.is_mapping() {
                    *slot = Value::Mapping(Mapping::new());
                }
                let target = slot.as_mapping_mut().unwrap();
                for (patch_key, patch_value) in patch {
                    target.insert(patch_key.clone(), patch_value.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn missing_field(job: &str, field: &str) -> Error {
    Error::ConfigParse {
        message: format!("job '{}' has no '{}' after resolution", job, field),
        hint: Some(format!("add '{}:' to the job or a parent it extends", field)),
    }
}

/// Normalize a script field: absent becomes empty, a bare string becomes a
/// one-command list.
fn command_list(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(cmd)) => Ok(vec![cmd.clone()]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| Error::ConfigParse {
                    message: format!("{} entries must be strings", field),
                    hint: None,
                })
            })
            .collect(),
        Some(_) => Err(Error::ConfigParse {
            message: format!("{} must be a command or a list of commands", field),
            hint: None,
        }),
    }
}

fn parse_image(value: &Value) -> Result<Image> {
    match value {
        Value::String(name) => Ok(Image::Reference(name.clone())),
        Value::Mapping(map) => {
            let name = map
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::ConfigParse {
                    message: "structured image requires a 'name'".to_string(),
                    hint: Some("use image: <ref> or image: {name: <ref>, entrypoint: [..]}".to_string()),
                })?
                .to_string();

            match map.get("entrypoint") {
                None => Ok(Image::Reference(name)),
                Some(ep) => {
                    let entrypoint = command_list(Some(ep), "entrypoint")?;
                    Ok(Image::WithEntrypoint { name, entrypoint })
                }
            }
        }
        _ => Err(Error::ConfigParse {
            message: "image must be a reference or a {name, entrypoint} mapping".to_string(),
            hint: None,
        }),
    }
}

fn parse_variables(value: Option<&Value>) -> Result<HashMap<String, String>> {
    let Some(value) = value else {
        return Ok(HashMap::new());
    };
    let map = value.as_mapping().ok_or_else(|| Error::ConfigParse {
        message: "variables must be a mapping".to_string(),
        hint: None,
    })?;

    let mut variables = HashMap::new();
    for (key, value) in map {
        let name = key.as_str().ok_or_else(|| Error::ConfigParse {
            message: "variable names must be strings".to_string(),
            hint: None,
        })?;
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                return Err(Error::ConfigParse {
                    message: format!("variable '{}' must be a scalar", name),
                    hint: None,
                })
            }
        };
        variables.insert(name.to_string(), rendered);
    }
    Ok(variables)
}

/// Normalize `needs`: absent becomes empty, a bare string becomes one entry,
/// structured entries contribute their `job` field. Duplicates keep their
/// first position.
fn parse_needs(value: Option<&Value>) -> Result<Vec<String>> {
    let raw = match value {
        None => Vec::new(),
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Sequence(items)) => {
            let mut names = Vec::new();
            for item in items {
                match item {
                    Value::String(name) => names.push(name.clone()),
                    Value::Mapping(map) => {
                        let name = map.get("job").and_then(Value::as_str).ok_or_else(|| {
                            Error::ConfigParse {
                                message: "structured needs entries require a 'job' name".to_string(),
                                hint: None,
                            }
                        })?;
                        names.push(name.to_string());
                    }
                    _ => {
                        return Err(Error::ConfigParse {
                            message: "needs entries must be job names".to_string(),
                            hint: None,
                        })
                    }
                }
            }
            names
        }
        Some(_) => {
            return Err(Error::ConfigParse {
                message: "needs must be a job name or a list of job names".to_string(),
                hint: None,
            })
        }
    };

    let mut needs = Vec::new();
    for name in raw {
        if !needs.contains(&name) {
            needs.push(name);
        }
    }
    Ok(needs)
}

/// Extract the concrete [`JobSpec`] fields from a flattened job mapping.
fn extract(job_name: &str, flat: &Mapping) -> Result<JobSpec> {
    let before = command_list(flat.get("before_script"), "before_script")?;
    let after = command_list(flat.get("after_script"), "after_script")?;

    let main = match flat.get("script") {
        None => return Err(missing_field(job_name, "script")),
        Some(value) => command_list(Some(value), "script")?,
    };
    if main.is_empty() {
        return Err(missing_field(job_name, "script"));
    }

    let image = match flat.get("image") {
        None => return Err(missing_field(job_name, "image")),
        Some(value) => parse_image(value)?,
    };

    let variables = parse_variables(flat.get("variables"))?;
    let needs = parse_needs(flat.get("needs"))?;

    Ok(JobSpec {
        before,
        main,
        after,
        image,
        variables,
        needs,
    })
}
