use std::{
    env,
    ffi::{OsStr, OsString},
    sync::{Mutex, MutexGuard, OnceLock},
};

/// Serializes tests that touch the process environment.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Overrides one environment variable until dropped, holding the env lock.
pub struct EnvVarGuard {
    key: OsString,
    original: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set(key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let guard = Self::capture(key.as_ref());
        unsafe { env::set_var(&guard.key, value) };
        guard
    }

    pub fn unset(key: impl AsRef<OsStr>) -> Self {
        let guard = Self::capture(key.as_ref());
        unsafe { env::remove_var(&guard.key) };
        guard
    }

    fn capture(key: &OsStr) -> Self {
        let lock = env_lock();
        Self {
            key: key.to_os_string(),
            original: env::var_os(key),
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.original {
            Some(value) => unsafe { env::set_var(&self.key, value) },
            None => unsafe { env::remove_var(&self.key) },
        }
    }
}
