//! Configuration management for nodevisor.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;

use crate::{
    error::ConfigError,
    runtime::{MachineType, RuntimeConfig, RuntimeMode},
    services::{ManifestService, ServiceManifest},
};

/// Top-level supervisor configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Mirror service output to the console.
    pub debug: bool,
    pub machine_type: MachineType,
    pub in_container: bool,
    /// Directory for per-service logs; defaults by [`RuntimeMode`].
    pub log_dir: Option<PathBuf>,
    /// `KEY=value` file consulted when expanding `${VAR}` references.
    pub env_file: Option<String>,
    /// Variables added to every service environment.
    pub environment: BTreeMap<String, String>,
    pub services: Vec<ServiceManifest>,
    /// Directory of the configuration file; relative paths resolve against it.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            debug: self.debug,
            machine_type: self.machine_type,
            in_container: self.in_container,
            environment: self
                .environment
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
        }
    }

    pub fn log_dir(&self, mode: RuntimeMode) -> PathBuf {
        match (&self.log_dir, &self.project_dir) {
            (Some(dir), Some(base)) if dir.is_relative() => base.join(dir),
            (Some(dir), _) => dir.clone(),
            (None, _) => mode.log_dir(),
        }
    }

    /// Builds the services, rejecting duplicate ids.
    pub fn services(&self) -> Result<Vec<ManifestService>, ConfigError> {
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(self.services.len());
        for manifest in &self.services {
            if !seen.insert(manifest.id.as_str()) {
                return Err(ConfigError::InvalidService {
                    service: manifest.id.clone(),
                    reason: "duplicate service id".to_string(),
                });
            }
            services.push(ManifestService::new(manifest.clone())?);
        }
        Ok(services)
    }
}

/// Only the fields needed before variables can be expanded.
#[derive(Debug, Default, Deserialize)]
struct Preamble {
    #[serde(default)]
    env_file: Option<String>,
}

fn env_var_pattern() -> Result<Regex, ConfigError> {
    Ok(Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?)
}

/// Expands `${VAR}` from `vars`, then from the process environment.
fn expand_env_vars(input: &str, vars: &HashMap<String, String>) -> Result<String, ConfigError> {
    let re = env_var_pattern()?;

    let lookup = |name: &str| vars.get(name).cloned().or_else(|| env::var(name).ok());
    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| lookup(name).is_none())
    {
        return Err(ConfigError::MissingVariable(missing));
    }

    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

/// Parses a `KEY=value` env file. Blank lines and `#` comments are skipped.
fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            vars.insert(key.to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Loads and parses the configuration file, expanding `${VAR}` references.
pub fn load_config(config_path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let preamble: Preamble = serde_yaml::from_str(&content)?;
    let vars = match preamble.env_file {
        Some(file) => {
            let path = Path::new(&file);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                base_path.join(path)
            };
            load_env_file(&path)?
        }
        None => HashMap::new(),
    };

    let expanded = expand_env_vars(&content, &vars)?;
    let mut config: SupervisorConfig = serde_yaml::from_str(&expanded)?;
    config.project_dir = Some(base_path);
    Ok(config)
}

/// Parses a duration written as `<number>[ms|s|m|h]`; a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::Duration(raw.to_string()));
    }

    let (amount, unit): (&str, fn(u64) -> Duration) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, Duration::from_millis)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, Duration::from_secs)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, |m| Duration::from_secs(m.saturating_mul(60)))
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, |h| Duration::from_secs(h.saturating_mul(3600)))
    } else {
        (value, Duration::from_secs)
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| ConfigError::Duration(raw.to_string()))?;
    Ok(unit(amount))
}
