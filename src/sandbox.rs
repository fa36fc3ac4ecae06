//! Process sandboxing applied between `fork` and `exec`.
//!
//! A [`SandboxPlan`] captures every adjustment a supervised process needs (cgroup,
//! OOM score, CPU and IO priority, scheduler, SELinux label, dropped capabilities,
//! uid). The plan is either encoded onto the `wrapperd` command line, which applies
//! it and then `exec`s the target, or applied directly in a `pre_exec` hook.
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use nix::unistd::getuid;
use serde::{Deserialize, Serialize};

use crate::constants::CGROUP_MOUNT_PATH;
#[cfg(target_os = "linux")]
use {
    caps::{CapSet, Capability, errors::CapsError},
    std::{collections::HashSet, str::FromStr},
};

/// IO scheduling class, as understood by `ioprio_set(2)`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IoPriorityClass {
    None = 0,
    #[strum(to_string = "rt", serialize = "realtime")]
    RealTime = 1,
    #[strum(to_string = "be", serialize = "best_effort")]
    BestEffort = 2,
    Idle = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPriority {
    pub class: IoPriorityClass,
    /// 0 (highest) to 7 (lowest).
    pub level: u8,
}

impl IoPriority {
    fn encoded(self) -> i32 {
        ((self.class as i32) << 13) | i32::from(self.level.min(7))
    }
}

/// CPU scheduling policy, mirroring `SCHED_*`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum SchedulingPolicy {
    Normal = 0,
    Fifo = 1,
    #[strum(to_string = "rr")]
    RoundRobin = 2,
    Batch = 3,
    Idle = 5,
    Deadline = 6,
}

/// Normalised privilege and resource plan for one process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxPlan {
    /// Service name, used in error messages.
    pub name: String,
    /// Cgroup (relative to the cgroup mount) the process joins.
    pub cgroup_path: Option<String>,
    /// Capabilities removed from the bounding and inheritable sets.
    pub dropped_capabilities: Vec<String>,
    /// Written to `/proc/self/oom_score_adj` when non-zero.
    pub oom_score_adj: i32,
    pub uid: Option<u32>,
    /// Nice value.
    pub priority: Option<i32>,
    pub io_priority: Option<IoPriority>,
    pub scheduling_policy: Option<SchedulingPolicy>,
    pub selinux_label: Option<String>,
}

impl SandboxPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Encodes the plan as `wrapperd` flags.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--name".into(), self.name.clone().into()];

        if let Some(cgroup) = &self.cgroup_path {
            args.extend(["--cgroup-path".into(), cgroup.into()]);
        }
        if !self.dropped_capabilities.is_empty() {
            args.extend([
                "--drop-caps".into(),
                self.dropped_capabilities.join(",").into(),
            ]);
        }
        if self.oom_score_adj != 0 {
            args.push(format!("--oom-score={}", self.oom_score_adj).into());
        }
        if let Some(uid) = self.uid {
            args.extend(["--uid".into(), uid.to_string().into()]);
        }
        if let Some(priority) = self.priority {
            args.push(format!("--priority={priority}").into());
        }
        if let Some(io) = self.io_priority {
            args.extend([
                "--io-priority-class".into(),
                io.class.to_string().into(),
                "--io-priority".into(),
                io.level.to_string().into(),
            ]);
        }
        if let Some(policy) = self.scheduling_policy {
            args.extend(["--scheduling-policy".into(), policy.to_string().into()]);
        }
        if let Some(label) = &self.selinux_label {
            args.extend(["--selinux-label".into(), label.into()]);
        }

        args
    }

    /// Applies every adjustment to the calling process.
    ///
    /// # Safety
    /// Call this only between `fork` and `exec` in the child process, or in a
    /// helper that is about to `exec`. It changes the caller's credentials.
    pub unsafe fn apply_pre_exec(&self) -> io::Result<()> {
        if let Some(cgroup) = &self.cgroup_path {
            attach_cgroup(Path::new(CGROUP_MOUNT_PATH), cgroup, std::process::id())?;
        }
        self.apply_oom_score()?;
        self.apply_priority()?;
        self.apply_io_priority()?;
        self.apply_scheduling_policy()?;
        self.apply_selinux_label()?;
        self.apply_dropped_capabilities()?;
        unsafe { self.apply_user_switch() }
    }

    fn apply_oom_score(&self) -> io::Result<()> {
        if self.oom_score_adj == 0 {
            return Ok(());
        }
        fs::write("/proc/self/oom_score_adj", self.oom_score_adj.to_string())
    }

    fn apply_priority(&self) -> io::Result<()> {
        let Some(priority) = self.priority else {
            return Ok(());
        };
        let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority as libc::c_int) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn apply_io_priority(&self) -> io::Result<()> {
        const IOPRIO_WHO_PROCESS: libc::c_int = 1;

        let Some(io) = self.io_priority else {
            return Ok(());
        };
        let res = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, io.encoded()) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_io_priority(&self) -> io::Result<()> {
        match self.io_priority {
            Some(_) => Err(unsupported("IO priority")),
            None => Ok(()),
        }
    }

    #[cfg(target_os = "linux")]
    fn apply_scheduling_policy(&self) -> io::Result<()> {
        let Some(policy) = self.scheduling_policy else {
            return Ok(());
        };
        if policy == SchedulingPolicy::Deadline {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "deadline scheduling requires explicit runtime parameters",
            ));
        }

        let param = libc::sched_param {
            sched_priority: match policy {
                SchedulingPolicy::Fifo | SchedulingPolicy::RoundRobin => 1,
                _ => 0,
            },
        };
        if unsafe { libc::sched_setscheduler(0, policy as libc::c_int, &param) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_scheduling_policy(&self) -> io::Result<()> {
        match self.scheduling_policy {
            Some(_) => Err(unsupported("scheduling policy")),
            None => Ok(()),
        }
    }

    fn apply_selinux_label(&self) -> io::Result<()> {
        let Some(label) = &self.selinux_label else {
            return Ok(());
        };
        fs::write("/proc/self/attr/exec", label.as_bytes())
    }

    #[cfg(target_os = "linux")]
    fn apply_dropped_capabilities(&self) -> io::Result<()> {
        // Capability management requires root privileges. Skip if not running as root.
        if self.dropped_capabilities.is_empty() || !getuid().is_root() {
            return Ok(());
        }

        for cap in parse_caps(&self.dropped_capabilities)? {
            for set in [CapSet::Bounding, CapSet::Inheritable, CapSet::Ambient] {
                caps::drop(None, set, cap).map_err(caps_err)?;
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_dropped_capabilities(&self) -> io::Result<()> {
        Ok(())
    }

    unsafe fn apply_user_switch(&self) -> io::Result<()> {
        let Some(uid) = self.uid else {
            return Ok(());
        };
        if !getuid().is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "service '{}' requested uid {uid} but the supervisor is not running as root",
                    self.name
                ),
            ));
        }

        if unsafe { libc::setgid(uid as libc::gid_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setuid(uid as libc::uid_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Moves `pid` into `<root>/<path>`, creating the cgroup if needed.
pub fn attach_cgroup(root: &Path, path: &str, pid: u32) -> io::Result<PathBuf> {
    let dir = root.join(path.trim_start_matches('/'));
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("cgroup.procs"), pid.to_string())?;
    Ok(dir)
}

#[cfg(target_os = "linux")]
fn parse_caps(names: &[String]) -> io::Result<HashSet<Capability>> {
    let mut caps_set = HashSet::with_capacity(names.len());
    for name in names {
        let trimmed = name.trim().to_ascii_uppercase();
        let canonical = if trimmed.starts_with("CAP_") {
            trimmed
        } else {
            format!("CAP_{trimmed}")
        };
        let cap = Capability::from_str(&canonical).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid capability '{name}'"),
            )
        })?;
        caps_set.insert(cap);
    }
    Ok(caps_set)
}

#[cfg(target_os = "linux")]
fn caps_err(err: CapsError) -> io::Error {
    io::Error::other(err.to_string())
}

#[cfg(not(target_os = "linux"))]
fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is only supported on Linux"),
    )
}
