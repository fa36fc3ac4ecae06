//! Services declared in the supervisor configuration file.
//!
//! A manifest describes a host process: its argv, what it waits for, how it is
//! restarted and sandboxed, and optionally a health command that is healthy when
//! it exits with status 0.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{
    conditions::{Condition, wait_for_files_to_exist},
    config::parse_duration,
    constants::{DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT, DEFAULT_RESTART_INTERVAL, WRAPPERD_PATH},
    error::{BoxError, ConfigError},
    health::{HealthCheck, Settings, health_check},
    runner::{
        Args, Options, Runner,
        process::ProcessRunner,
        restart::{RestartPolicy, RestartRunner},
    },
    runtime::Runtime,
    service::{HealthcheckedService, Service},
};

/// Restart behaviour as written in manifests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Always,
    Never,
    UntilSuccess,
}

impl From<RestartMode> for RestartPolicy {
    fn from(mode: RestartMode) -> Self {
        match mode {
            RestartMode::Always => RestartPolicy::Forever,
            RestartMode::Never => RestartPolicy::Once,
            RestartMode::UntilSuccess => RestartPolicy::UntilSuccess,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthManifest {
    pub command: Vec<String>,
    pub initial_delay: Option<String>,
    pub period: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceManifest {
    pub id: String,
    pub command: Vec<String>,
    pub depends_on: Vec<String>,
    pub volumes: Vec<String>,
    pub wait_for_files: Vec<PathBuf>,
    pub restart: RestartMode,
    pub restart_interval: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub graceful_shutdown_timeout: Option<String>,
    pub oom_score_adj: i32,
    pub cgroup: Option<String>,
    pub priority: Option<i32>,
    pub uid: Option<u32>,
    pub drop_capabilities: Vec<String>,
    pub log_to_console: bool,
    pub health: Option<HealthManifest>,
    pub allow_start: bool,
    pub allow_stop: bool,
    pub allow_restart: bool,
}

fn duration_or(
    id: &str,
    field: &str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) => parse_duration(raw).map_err(|err| ConfigError::InvalidService {
            service: id.to_string(),
            reason: format!("{field}: {err}"),
        }),
    }
}

/// Process service built from a [`ServiceManifest`].
#[derive(Debug, Clone)]
pub struct ManifestService {
    manifest: ServiceManifest,
    restart_interval: Duration,
    graceful_shutdown_timeout: Duration,
    health_settings: Settings,
    wrapper: Option<PathBuf>,
}

impl ManifestService {
    /// Validates the manifest. The sandbox wrapper is used when it is installed.
    pub fn new(manifest: ServiceManifest) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidService {
            service: manifest.id.clone(),
            reason: reason.to_string(),
        };

        if manifest.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if manifest.command.is_empty() {
            return Err(invalid("command must not be empty"));
        }
        if manifest.depends_on.contains(&manifest.id) {
            return Err(invalid("service cannot depend on itself"));
        }

        let id = manifest.id.as_str();
        let restart_interval = duration_or(
            id,
            "restart_interval",
            manifest.restart_interval.as_deref(),
            DEFAULT_RESTART_INTERVAL,
        )?;
        let graceful_shutdown_timeout = duration_or(
            id,
            "graceful_shutdown_timeout",
            manifest.graceful_shutdown_timeout.as_deref(),
            DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        )?;

        let defaults = Settings::default();
        let health_settings = match &manifest.health {
            None => defaults,
            Some(health) => {
                if health.command.is_empty() {
                    return Err(invalid("health command must not be empty"));
                }
                Settings {
                    initial_delay: duration_or(
                        id,
                        "health.initial_delay",
                        health.initial_delay.as_deref(),
                        defaults.initial_delay,
                    )?,
                    period: duration_or(id, "health.period", health.period.as_deref(), defaults.period)?,
                    timeout: duration_or(
                        id,
                        "health.timeout",
                        health.timeout.as_deref(),
                        defaults.timeout,
                    )?,
                }
            }
        };

        let wrapper = Path::new(WRAPPERD_PATH)
            .exists()
            .then(|| PathBuf::from(WRAPPERD_PATH));

        Ok(Self {
            manifest,
            restart_interval,
            graceful_shutdown_timeout,
            health_settings,
            wrapper,
        })
    }

    pub fn with_wrapper(mut self, wrapper: Option<PathBuf>) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn manifest(&self) -> &ServiceManifest {
        &self.manifest
    }

    fn options(&self, runtime: &Runtime) -> Options {
        let manifest = &self.manifest;
        let env = runtime
            .config()
            .environment
            .iter()
            .cloned()
            .chain(manifest.environment.iter().map(|(k, v)| format!("{k}={v}")));

        let mut opts = Options::default()
            .with_logging(Arc::clone(runtime.logging()))
            .with_env(env)
            .with_graceful_shutdown_timeout(self.graceful_shutdown_timeout)
            .with_oom_score_adj(manifest.oom_score_adj)
            .with_dropped_capabilities(manifest.drop_capabilities.iter().cloned())
            .with_wrapper(self.wrapper.clone());
        if let Some(cgroup) = &manifest.cgroup {
            opts = opts.with_cgroup_path(cgroup.clone());
        }
        if let Some(priority) = manifest.priority {
            opts = opts.with_priority(priority);
        }
        if let Some(uid) = manifest.uid {
            opts = opts.with_uid(uid);
        }
        opts
    }
}

#[async_trait]
impl Service for ManifestService {
    fn id(&self, _runtime: &Runtime) -> String {
        self.manifest.id.clone()
    }

    fn condition(&self, _runtime: &Runtime) -> Option<Arc<dyn Condition>> {
        if self.manifest.wait_for_files.is_empty() {
            None
        } else {
            Some(wait_for_files_to_exist(self.manifest.wait_for_files.iter().cloned()))
        }
    }

    fn depends_on(&self, _runtime: &Runtime) -> Vec<String> {
        self.manifest.depends_on.clone()
    }

    fn volumes(&self, _runtime: &Runtime) -> Vec<String> {
        self.manifest.volumes.clone()
    }

    fn runner(&self, runtime: &Arc<Runtime>) -> Result<Option<Box<dyn Runner>>, BoxError> {
        let debug = runtime.config().debug || self.manifest.log_to_console;
        let process = ProcessRunner::new(
            debug,
            Args::new(self.manifest.id.clone(), self.manifest.command.iter().cloned()),
            self.options(runtime),
        );

        let runner = RestartRunner::new(Arc::new(process))
            .with_policy(self.manifest.restart.into())
            .with_interval(self.restart_interval);
        Ok(Some(Box::new(runner)))
    }

    fn healthcheck(&self) -> Option<&dyn HealthcheckedService> {
        self.manifest.health.as_ref().map(|_| self as &dyn HealthcheckedService)
    }

    fn api_start_allowed(&self, _runtime: &Runtime) -> bool {
        self.manifest.allow_start
    }

    fn api_stop_allowed(&self, _runtime: &Runtime) -> bool {
        self.manifest.allow_stop
    }

    fn api_restart_allowed(&self, _runtime: &Runtime) -> bool {
        self.manifest.allow_restart
    }
}

impl HealthcheckedService for ManifestService {
    fn health_func(&self, _runtime: &Runtime) -> HealthCheck {
        let argv: Arc<[String]> = self
            .manifest
            .health
            .as_ref()
            .map(|health| health.command.clone())
            .unwrap_or_default()
            .into();

        health_check(move |ctx| {
            let argv = Arc::clone(&argv);
            async move {
                let (program, args) = argv.split_first().ok_or("no health command")?;
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;

                let output = tokio::select! {
                    output = child.wait_with_output() => output?,
                    _ = ctx.cancelled() => return Err("health command cancelled".into()),
                };

                if output.status.success() {
                    return Ok(());
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Err(format!("health command {}", output.status).into())
                } else {
                    Err(format!("health command {}: {stderr}", output.status).into())
                }
            }
        })
    }

    fn health_settings(&self, _runtime: &Runtime) -> Settings {
        self.health_settings
    }
}
