//! Command-line interfaces for the `nodevisor` and `wrapperd` binaries.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::sandbox::{IoPriority, IoPriorityClass, SandboxPlan, SchedulingPolicy};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for nodevisor.
#[derive(Parser)]
#[command(name = "nodevisor", version, author)]
#[command(about = "Supervisor for node system services", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for nodevisor.
#[derive(Subcommand)]
pub enum Commands {
    /// Load the configuration, start services and supervise them until SIGINT/SIGTERM.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "nodevisor.yaml")]
        config: PathBuf,

        /// Start only these services. Every configured service is still loaded.
        #[arg(short, long)]
        service: Vec<String>,

        /// Become a child subreaper and reap orphaned processes.
        #[arg(long)]
        reap: bool,
    },

    /// Check the configuration and print the services it defines.
    Validate {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "nodevisor.yaml")]
        config: PathBuf,
    },

    /// Show the tail of a service log.
    Logs {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "nodevisor.yaml")]
        config: PathBuf,

        /// The service whose log should be displayed.
        #[arg(short, long)]
        service: String,

        /// Number of lines to show.
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Flags understood by `wrapperd`; produced by [`SandboxPlan::to_args`].
#[derive(Parser, Debug)]
#[command(name = "wrapperd", version)]
#[command(about = "Applies a process sandbox, then executes the target command", long_about = None)]
pub struct WrapperArgs {
    /// Service name, for error messages.
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub cgroup_path: Option<String>,

    /// Comma separated capabilities to drop.
    #[arg(long, value_delimiter = ',')]
    pub drop_caps: Vec<String>,

    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub oom_score: i32,

    #[arg(long)]
    pub uid: Option<u32>,

    #[arg(long, allow_hyphen_values = true)]
    pub priority: Option<i32>,

    #[arg(long, requires = "io_priority")]
    pub io_priority_class: Option<IoPriorityClass>,

    #[arg(long, requires = "io_priority_class")]
    pub io_priority: Option<u8>,

    #[arg(long)]
    pub scheduling_policy: Option<SchedulingPolicy>,

    #[arg(long)]
    pub selinux_label: Option<String>,

    /// Program and arguments to execute, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl WrapperArgs {
    pub fn plan(&self) -> SandboxPlan {
        SandboxPlan {
            name: self.name.clone(),
            cgroup_path: self.cgroup_path.clone(),
            dropped_capabilities: self.drop_caps.clone(),
            oom_score_adj: self.oom_score,
            uid: self.uid,
            priority: self.priority,
            io_priority: self
                .io_priority_class
                .zip(self.io_priority)
                .map(|(class, level)| IoPriority { class, level }),
            scheduling_policy: self.scheduling_policy,
            selinux_label: self.selinux_label.clone(),
        }
    }
}
