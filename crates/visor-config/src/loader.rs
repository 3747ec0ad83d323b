//! Source resolution and merging. Extends chains are walked parent-first
//! with a cycle guard on the normalized source (absolute local path,
//! lowercased URL) and a bounded depth; the child document always wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use visor_types::{StepConfig, VisorConfig};

use crate::validate;
use crate::{ConfigError, LoadedConfig, LoaderOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Local(PathBuf),
    Remote(String),
}

impl Source {
    /// Canonical identity used by the cycle guard.
    fn normalized(&self) -> String {
        match self {
            Source::Local(path) => path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string(),
            Source::Remote(url) => url.to_ascii_lowercase(),
        }
    }

    fn display_name(&self) -> String {
        match self {
            Source::Local(path) => path.display().to_string(),
            Source::Remote(url) => url.clone(),
        }
    }
}

struct Resolver<'a> {
    options: &'a LoaderOptions,
    root_dir: PathBuf,
    visited: HashSet<String>,
    depth: usize,
}

/// Load, resolve and validate the configuration at `path`.
pub async fn load_config(
    path: &Path,
    options: &LoaderOptions,
) -> Result<LoadedConfig, ConfigError> {
    let root = Source::Local(path.to_path_buf());
    let root_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut resolver = Resolver {
        options,
        root_dir,
        visited: HashSet::new(),
        depth: 0,
    };
    let document = resolver.resolve(&root).await?;

    let mut warnings = Vec::new();
    let document = normalize_steps(document, &mut warnings);
    warnings.extend(validate::validate_document(&document)?);

    let config = into_config(document)?;
    warnings.extend(validate::validate_semantics(&config)?);

    Ok(LoadedConfig { config, warnings })
}

impl Resolver<'_> {
    async fn resolve(&mut self, source: &Source) -> Result<Value, ConfigError> {
        if self.depth > self.options.max_extends_depth {
            return Err(ConfigError::ExtendsTooDeep(self.options.max_extends_depth));
        }
        let id = source.normalized();
        if !self.visited.insert(id.clone()) {
            return Err(ConfigError::CircularExtends(source.display_name()));
        }

        let mut document = self.read(source).await?;
        let parents = take_parent_refs(&mut document);

        let mut merged = Value::Mapping(Mapping::new());
        for reference in parents {
            let parent_source = self.reference_to_source(source, &reference)?;
            debug!(parent = %parent_source.display_name(), child = %source.display_name(), "resolving extends");
            self.depth += 1;
            let parent = Box::pin(self.resolve(&parent_source)).await?;
            self.depth -= 1;
            deep_merge(&mut merged, &parent);
        }
        deep_merge(&mut merged, &document);
        // The guard is per-chain: a diamond (two parents sharing a base) is
        // legal, only a cycle is not.
        self.visited.remove(&id);
        Ok(merged)
    }

    async fn read(&self, source: &Source) -> Result<Value, ConfigError> {
        let raw = match source {
            Source::Local(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| ConfigError::Read {
                        source_name: source.display_name(),
                        message: err.to_string(),
                    })?
            }
            Source::Remote(url) => {
                let client = reqwest::Client::builder()
                    .timeout(self.options.http_timeout)
                    .build()
                    .map_err(|err| ConfigError::Http {
                        url: url.clone(),
                        message: err.to_string(),
                    })?;
                let response = client
                    .get(url)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|err| ConfigError::Http {
                        url: url.clone(),
                        message: err.to_string(),
                    })?;
                response.text().await.map_err(|err| ConfigError::Http {
                    url: url.clone(),
                    message: err.to_string(),
                })?
            }
        };
        serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse {
            source_name: source.display_name(),
            message: err.to_string(),
        })
    }

    fn reference_to_source(
        &self,
        from: &Source,
        reference: &str,
    ) -> Result<Source, ConfigError> {
        if reference.starts_with("https://") {
            if !self.options.allow_remote_extends {
                return Err(ConfigError::RemoteDisabled(reference.to_string()));
            }
            if !self.options.remote_allowlist.is_empty()
                && !self
                    .options
                    .remote_allowlist
                    .iter()
                    .any(|prefix| reference.starts_with(prefix))
            {
                return Err(ConfigError::RemoteNotAllowed(reference.to_string()));
            }
            return Ok(Source::Remote(reference.to_string()));
        }
        if reference.starts_with("http://") {
            return Err(ConfigError::InsecureRemote(reference.to_string()));
        }

        let base = match from {
            Source::Local(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            // A remote parent must not reach into the local filesystem.
            Source::Remote(url) => {
                return Err(ConfigError::PathTraversal(format!(
                    "'{reference}' referenced from remote '{url}'"
                )))
            }
        };
        let resolved = base.join(reference);
        if self.options.restrict_to_root {
            let canonical_root = self
                .root_dir
                .canonicalize()
                .unwrap_or_else(|_| self.root_dir.clone());
            let canonical = resolved
                .canonicalize()
                .unwrap_or_else(|_| resolved.clone());
            if !canonical.starts_with(&canonical_root) {
                return Err(ConfigError::PathTraversal(reference.to_string()));
            }
        }
        Ok(Source::Local(resolved))
    }
}

/// Pull `extends` / `include` references out of a document.
fn take_parent_refs(document: &mut Value) -> Vec<String> {
    let Value::Mapping(map) = document else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    for key in ["extends", "include"] {
        match map.remove(&Value::String(key.to_string())) {
            Some(Value::String(one)) => refs.push(one),
            Some(Value::Sequence(many)) => {
                refs.extend(many.into_iter().filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                }));
            }
            _ => {}
        }
    }
    refs
}

/// Recursive merge; overlay wins on scalars and sequences, objects merge
/// key-by-key. Nulls in the overlay are ignored.
fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() && !is_transition_to_key(key) {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

/// `to: null` and `goto: null` are semantically meaningful (goto
/// suppression) and must survive the merge.
fn is_transition_to_key(key: &Value) -> bool {
    matches!(key, Value::String(s) if s == "to" || s == "goto")
}

/// Merge `checks` into `steps` (the preferred spelling wins on clashes)
/// and return the normalized document.
fn normalize_steps(mut document: Value, warnings: &mut Vec<String>) -> Value {
    let Value::Mapping(map) = &mut document else {
        return document;
    };
    let checks = map.remove(&Value::String("checks".to_string()));
    let Some(Value::Mapping(checks)) = checks else {
        return document;
    };

    let steps_entry = map
        .entry(Value::String("steps".to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if let Value::Mapping(steps) = steps_entry {
        for (name, body) in checks {
            if steps.contains_key(&name) {
                if let Value::String(name) = &name {
                    warnings.push(format!(
                        "step '{name}' is declared under both `steps` and `checks`; keeping `steps`"
                    ));
                }
                continue;
            }
            steps.insert(name, body);
        }
    }
    document
}

/// Build the normalized config, preserving the source order of steps.
fn into_config(document: Value) -> Result<VisorConfig, ConfigError> {
    let mut map = match document {
        Value::Mapping(map) => map,
        _ => {
            return Err(ConfigError::Invalid(vec![
                "configuration root must be a mapping".to_string(),
            ]))
        }
    };
    let steps_value = map.remove(&Value::String("steps".to_string()));

    let mut config: VisorConfig =
        serde_yaml::from_value(Value::Mapping(map)).map_err(|err| {
            ConfigError::Invalid(vec![format!("configuration does not deserialize: {err}")])
        })?;

    if let Some(Value::Mapping(steps)) = steps_value {
        for (name, body) in steps {
            let Value::String(name) = name else {
                return Err(ConfigError::Invalid(vec![
                    "step names must be strings".to_string(),
                ]));
            };
            let mut step: StepConfig = serde_yaml::from_value(body).map_err(|err| {
                ConfigError::Invalid(vec![format!("step '{name}' does not deserialize: {err}")])
            })?;
            step.name = name;
            config.steps.push(step);
        }
    }
    Ok(config)
}
