//! Shared constants used across the nodevisor codebase.

use std::time::Duration;

// ============================================================================
// Events
// ============================================================================

/// Number of events retained per service.
pub const MAX_EVENTS_TO_KEEP: usize = 64;

/// Capacity of the runtime event bus.
pub const EVENT_BUS_CAPACITY: usize = 1024;

// ============================================================================
// Conditions
// ============================================================================

/// How often a waiting service re-renders its condition description.
pub const WAIT_CONDITION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval for file existence conditions.
pub const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Runners
// ============================================================================

/// Time between SIGTERM and SIGKILL when stopping a runner.
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between restart cycles.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(5);

/// Sandbox helper re-executed in front of supervised processes.
pub const WRAPPERD_PATH: &str = "/sbin/wrapperd";

/// `PATH` handed to processes that do not inherit the supervisor environment.
pub const DEFAULT_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin:/usr/local/bin";

/// Buffer size used when copying process output into service logs.
pub const LOG_BUFFER_SIZE: usize = 8192;

/// Maximum number of backtrace bytes attached to a task panic.
pub const PANIC_STACK_LIMIT: usize = 8192;

/// Root of the unified cgroup hierarchy.
pub const CGROUP_MOUNT_PATH: &str = "/sys/fs/cgroup";

// ============================================================================
// Container runtime
// ============================================================================

/// Namespace system containers are created in.
pub const SYSTEM_CONTAINERD_NAMESPACE: &str = "system";

/// Socket of the system container runtime.
pub const SYSTEM_CONTAINERD_ADDRESS: &str = "/system/run/containerd/containerd.sock";

/// Bound on container deletion during runner close.
pub const CONTAINER_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Health checks
// ============================================================================

pub const DEFAULT_HEALTH_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_HEALTH_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_millis(500);

/// Queue depth for health change subscribers.
pub const HEALTH_SUBSCRIBER_BUFFER: usize = 2;

// ============================================================================
// Supervisor
// ============================================================================

/// Deadline for reverse dependencies to go down, and for the whole shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Volumes
// ============================================================================

/// Finalizer placed on volume mount statuses while a service uses them.
pub const VOLUME_FINALIZER: &str = "service";

/// Resource namespace holding volume mount requests and statuses.
pub const VOLUME_NAMESPACE: &str = "block";

pub const VOLUME_MOUNT_REQUEST_TYPE: &str = "VolumeMountRequests.block.nodevisor.dev";
pub const VOLUME_MOUNT_STATUS_TYPE: &str = "VolumeMountStatuses.block.nodevisor.dev";
