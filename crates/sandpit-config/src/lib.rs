#![warn(missing_docs)]

//! # sandpit-config
//!
//! Configuration loading for the sandpit execution sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! test_timeout_secs = 10
//! max_heap_mb = 64
//! max_live_contexts = 8
//! parallelism = 1
//!
//! [relay]
//! host_origin = "https://exams.example.com"
//! target_origin = "document"
//!
//! [runtime]
//! babel_url = "https://unpkg.com/@babel/standalone@7.23.5/babel.min.js"
//!
//! [runtime.local]
//! "https://unpkg.com/@babel/standalone@7.23.5/babel.min.js" = "${VENDOR_DIR}/babel.min.js"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Live-context limit applied when `sandbox.max_live_contexts` is unset.
pub const DEFAULT_MAX_LIVE_CONTEXTS: usize = 8;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level sandpit configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandpitConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Relay channel trust boundary.
    #[serde(default)]
    pub relay: RelayOverrides,

    /// Runtime libraries injected for react-component documents.
    #[serde(default)]
    pub runtime: RuntimeOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Per-test-case deadline in seconds.
    #[serde(default)]
    pub test_timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum size of a single source part in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum number of isolated contexts alive at once.
    #[serde(default)]
    pub max_live_contexts: Option<usize>,

    /// Number of test cases run concurrently (1 = sequential).
    #[serde(default)]
    pub parallelism: Option<usize>,
}

/// Relay channel overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayOverrides {
    /// Origin of the page hosting the sandbox frames.
    #[serde(default)]
    pub host_origin: Option<String>,

    /// Target origin used by the sandbox when posting messages:
    /// `"document"`, `"*"`, or an explicit `scheme://host[:port]` origin.
    #[serde(default)]
    pub target_origin: Option<String>,
}

/// Runtime library overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeOverrides {
    /// URL of the component framework runtime.
    #[serde(default)]
    pub react_url: Option<String>,

    /// URL of the DOM renderer runtime.
    #[serde(default)]
    pub react_dom_url: Option<String>,

    /// URL of the in-document JSX transpiler.
    #[serde(default)]
    pub babel_url: Option<String>,

    /// Local copies of runtime libraries, keyed by URL. Used by headless
    /// contexts, which have no network access.
    #[serde(default)]
    pub local: HashMap<String, PathBuf>,
}

impl SandpitConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: SandpitConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.test_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.test_timeout_secs must be at least 1".into(),
            ));
        }
        if self.sandbox.max_heap_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be at least 1".into(),
            ));
        }
        if self.sandbox.max_code_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_code_kb must be at least 1".into(),
            ));
        }
        if self.sandbox.max_live_contexts == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_live_contexts must be at least 1".into(),
            ));
        }
        if let Some(parallelism) = self.sandbox.parallelism {
            if parallelism == 0 {
                return Err(ConfigError::Invalid(
                    "sandbox.parallelism must be at least 1".into(),
                ));
            }
            let live = self
                .sandbox
                .max_live_contexts
                .unwrap_or(DEFAULT_MAX_LIVE_CONTEXTS);
            if parallelism > live {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.parallelism ({}) exceeds sandbox.max_live_contexts ({})",
                    parallelism, live
                )));
            }
        }
        if let Some(origin) = &self.relay.host_origin {
            if !is_origin(origin) {
                return Err(ConfigError::Invalid(format!(
                    "relay.host_origin '{}' is not a scheme://host[:port] origin",
                    origin
                )));
            }
        }
        if let Some(target) = &self.relay.target_origin {
            if target != "document" && target != "*" && !is_origin(target) {
                return Err(ConfigError::Invalid(format!(
                    "relay.target_origin '{}': expected \"document\", \"*\" or an origin",
                    target
                )));
            }
        }
        Ok(())
    }
}

/// An origin is `scheme://host[:port]` with nothing after the authority.
fn is_origin(value: &str) -> bool {
    match value.split_once("://") {
        Some((scheme, authority)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
                && !authority.is_empty()
                && !authority.contains('/')
        }
        None => false,
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
