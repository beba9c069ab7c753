use anyhow::{Context, Result};
use handlebars::Handlebars;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::DiscoveryError;

/// Top-level YAML configuration file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Discovery instance name → raw config fragment.
    ///
    /// The instance name doubles as the factory name unless the fragment
    /// carries an explicit `type` key.
    #[serde(default)]
    pub discoveries: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    /// Factory name for a discovery instance.
    pub fn discovery_type<'a>(name: &'a str, fragment: &'a serde_yaml::Value) -> &'a str {
        fragment
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or(name)
    }
}

/// Where published payloads go when a source does not pick a config object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WriteTo {
    File,
    Configmap,
}

/// Process-wide runtime options, read from flags and environment.
#[derive(Debug, Clone)]
pub struct Options {
    pub region: String,
    pub namespace: String,
    pub version: String,
    pub write_to: WriteTo,
    pub configmap_name: Option<String>,
    pub output_dir: PathBuf,
    pub metrics_prefix: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            region: "qa-de-1".to_string(),
            namespace: "kube-monitoring".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            write_to: WriteTo::File,
            configmap_name: None,
            output_dir: PathBuf::from("."),
            metrics_prefix: "atlas".to_string(),
        }
    }
}

/// Output settings every discovery config carries.
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Poll interval in seconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// File name in the output directory, or data key in the config object.
    pub targets_file_name: String,
    /// Publish into this config object instead of the default target.
    #[serde(default)]
    pub configmap_name: Option<String>,
}

fn default_refresh_interval() -> u64 {
    300
}

impl OutputConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn validate(&self, name: &str) -> Result<(), DiscoveryError> {
        if self.refresh_interval == 0 {
            return Err(DiscoveryError::config(name, "refresh_interval must be > 0"));
        }
        if self.targets_file_name.trim().is_empty() {
            return Err(DiscoveryError::config(name, "targets_file_name must be set"));
        }
        Ok(())
    }
}

/// Values available to `{{ ... }}` placeholders in discovery fragments.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateValues {
    #[serde(rename = "Region")]
    pub region: String,
}

impl TemplateValues {
    pub fn from_options(options: &Options) -> Self {
        Self {
            region: options.region.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

    for (name, fragment) in &config.discoveries {
        if !fragment.is_mapping() {
            anyhow::bail!("discoveries.{} must be a mapping", name);
        }
    }

    Ok(config)
}

/// Matches `{{ .Name }}` and captures `Name`.
fn go_placeholder() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"))
        .as_ref()
        .map_err(|e| format!("placeholder pattern: {}", e))
}

/// Renders `{{ Region }}` (or Go-style `{{ .Region }}`) placeholders.
///
/// Unknown placeholders are an error so that typos surface at startup.
pub fn render_template(text: &str, values: &TemplateValues) -> Result<String, String> {
    let normalized = go_placeholder()?.replace_all(text, "{{${1}}}");

    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);
    hb.render_template(&normalized, values)
        .map_err(|e| e.to_string())
}

/// Renders a raw fragment through the template and decodes it into `T`.
pub fn decode_discovery_config<T: DeserializeOwned>(
    name: &str,
    raw: &serde_yaml::Value,
    values: &TemplateValues,
) -> Result<T, DiscoveryError> {
    let text = serde_yaml::to_string(raw).map_err(|e| DiscoveryError::config(name, e.to_string()))?;
    let rendered = render_template(&text, values).map_err(|e| DiscoveryError::config(name, e))?;
    serde_yaml::from_str(&rendered).map_err(|e| DiscoveryError::config(name, e.to_string()))
}
