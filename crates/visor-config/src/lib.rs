//! Configuration loading: YAML/JSON parse, `extends`/`include` chain
//! resolution (local paths and guarded HTTPS URLs), `steps`↔`checks`
//! normalization and schema plus semantic validation.

mod loader;
mod validate;

use std::time::Duration;

use thiserror::Error;

use visor_types::VisorConfig;

pub use loader::load_config;
pub use validate::{validate_document, validate_semantics};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{source_name}': {message}")]
    Read { source_name: String, message: String },
    #[error("failed to parse '{source_name}': {message}")]
    Parse { source_name: String, message: String },
    #[error("extends chain exceeds the maximum depth of {0}")]
    ExtendsTooDeep(usize),
    #[error("circular extends: '{0}' appears twice in the chain")]
    CircularExtends(String),
    #[error("remote extends are disabled: {0}")]
    RemoteDisabled(String),
    #[error("remote extends '{0}' does not match the allowlist")]
    RemoteNotAllowed(String),
    #[error("extends '{0}' must use https")]
    InsecureRemote(String),
    #[error("extends path '{0}' escapes the configuration root")]
    PathTraversal(String),
    #[error("remote fetch failed for '{url}': {message}")]
    Http { url: String, message: String },
    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Loader options, resolved at the binary edge. The loader itself never
/// reads environment variables.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub allow_remote_extends: bool,
    /// URL prefixes remote extends must match; empty allows any https URL.
    pub remote_allowlist: Vec<String>,
    pub max_extends_depth: usize,
    pub http_timeout: Duration,
    /// Keep local extends inside the root config's directory tree.
    pub restrict_to_root: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            allow_remote_extends: true,
            remote_allowlist: Vec::new(),
            max_extends_depth: 10,
            http_timeout: Duration::from_secs(30),
            restrict_to_root: true,
        }
    }
}

/// A successfully loaded configuration plus non-fatal findings.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: VisorConfig,
    pub warnings: Vec<String>,
}
