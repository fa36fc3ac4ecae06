//! Process-wide service registry.
//!
//! The [`Supervisor`] owns one [`ServiceRunner`] per loaded service and at most one
//! driver task per runner. Stopping honours reverse dependencies: a service is only
//! cancelled once everything that depends on it is down, or once the shutdown
//! timeout (by default [`SHUTDOWN_TIMEOUT`]) has passed.

pub mod wait;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    conditions::{Condition, all},
    constants::{SHUTDOWN_TIMEOUT, WAIT_CONDITION_CHECK_INTERVAL},
    error::{ApiOperation, ConditionError, SupervisorError},
    runtime::Runtime,
    service::Service,
    service_runner::{ServiceRunner, StateEvent},
    util::lock,
};
use wait::wait_for_service_in;

pub use wait::{ServiceStateCondition, wait_for_service};

static INSTANCE: OnceLock<Supervisor> = OnceLock::new();

#[derive(Default)]
struct State {
    services: HashMap<String, Arc<ServiceRunner>>,
    terminating: bool,
}

pub(crate) struct Registry {
    runtime: Arc<Runtime>,
    state: Mutex<State>,
    /// Ids with a live driver task. Separate from `state` so spawning never nests locks.
    running: Mutex<HashSet<String>>,
    stopped: Notify,
    tracker: TaskTracker,
    wait_interval: Duration,
    shutdown_timeout: Duration,
}

impl Registry {
    pub(crate) fn runner(&self, id: &str) -> Option<Arc<ServiceRunner>> {
        lock(&self.state).services.get(id).cloned()
    }

    fn is_running(&self, id: &str) -> bool {
        lock(&self.running).contains(id)
    }

    fn driver_exited(&self, id: &str) {
        lock(&self.running).remove(id);
        self.stopped.notify_waiters();
    }

    /// Resolves once none of `ids` has a live driver task.
    async fn wait_drivers(&self, ctx: &CancellationToken, ids: &[String]) -> Result<(), ConditionError> {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !ids.iter().any(|id| self.is_running(id)) {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = ctx.cancelled() => return Err(ConditionError::Cancelled),
            }
        }
    }
}

/// Handle to a service registry. Clones share the registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Registry>,
}

impl Supervisor {
    /// The process-wide supervisor. The runtime of the first call is kept; later
    /// arguments are ignored.
    pub fn instance(runtime: Arc<Runtime>) -> Supervisor {
        INSTANCE.get_or_init(|| Supervisor::new(runtime)).clone()
    }

    /// A standalone registry, independent of [`Supervisor::instance`].
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_wait_interval(runtime, WAIT_CONDITION_CHECK_INTERVAL)
    }

    /// Like [`Supervisor::new`], with a custom interval for re-rendering `Waiting` events.
    pub fn with_wait_interval(runtime: Arc<Runtime>, wait_interval: Duration) -> Self {
        Self::with_timeouts(runtime, wait_interval, SHUTDOWN_TIMEOUT)
    }

    /// Like [`Supervisor::with_wait_interval`], also bounding how long a service
    /// being stopped waits for its reverse dependencies.
    pub fn with_timeouts(
        runtime: Arc<Runtime>,
        wait_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Registry {
                runtime,
                state: Mutex::new(State::default()),
                running: Mutex::new(HashSet::new()),
                stopped: Notify::new(),
                tracker: TaskTracker::new(),
                wait_interval,
                shutdown_timeout,
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.inner.runtime
    }

    /// Registers services and returns their ids. Already loaded ids are kept as is.
    pub fn load<I>(&self, services: I) -> Vec<String>
    where
        I: IntoIterator<Item = Arc<dyn Service>>,
    {
        let mut state = lock(&self.inner.state);
        if state.terminating {
            return Vec::new();
        }

        let mut ids = Vec::new();
        for service in services {
            let id = service.id(&self.inner.runtime);
            ids.push(id.clone());

            if state.services.contains_key(&id) {
                continue;
            }

            let runner = ServiceRunner::new(
                service,
                Arc::clone(&self.inner.runtime),
                Arc::downgrade(&self.inner),
            )
            .with_wait_interval(self.inner.wait_interval);
            debug!("loaded service {id}");
            state.services.insert(id, Arc::new(runner));
        }
        ids
    }

    /// Starts a driver task for each id that isn't already running.
    pub fn start<S: AsRef<str>>(&self, ids: &[S]) -> Result<(), SupervisorError> {
        let runners = {
            let state = lock(&self.inner.state);
            if state.terminating {
                return Ok(());
            }
            ids.iter()
                .map(|id| {
                    let id = id.as_ref();
                    state
                        .services
                        .get(id)
                        .cloned()
                        .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))
                })
                .collect::<Vec<_>>()
        };

        let mut errors = Vec::new();
        for runner in runners {
            let runner = match runner {
                Ok(runner) => runner,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            if !lock(&self.inner.running).insert(runner.id().to_string()) {
                continue;
            }

            let registry = Arc::clone(&self.inner);
            self.inner.tracker.spawn(async move {
                runner.start().await;
                registry.driver_exited(runner.id());
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SupervisorError::Aggregate(errors)),
        }
    }

    pub fn start_all(&self) -> Result<(), SupervisorError> {
        let ids: Vec<String> = lock(&self.inner.state).services.keys().cloned().collect();
        self.start(&ids)
    }

    pub fn load_and_start<I>(&self, services: I) -> Result<(), SupervisorError>
    where
        I: IntoIterator<Item = Arc<dyn Service>>,
    {
        let ids = self.load(services);
        self.start(&ids)
    }

    /// Stops services without waiting for their reverse dependencies.
    pub async fn stop<S: AsRef<str>>(
        &self,
        ctx: &CancellationToken,
        ids: &[S],
    ) -> Result<(), SupervisorError> {
        if lock(&self.inner.state).terminating {
            return Ok(());
        }
        self.stop_services(ctx, ids, false).await
    }

    /// Stops services together with everything depending on them, dependents first.
    pub async fn stop_with_rev_dependencies<S: AsRef<str>>(
        &self,
        ctx: &CancellationToken,
        ids: &[S],
    ) -> Result<(), SupervisorError> {
        if lock(&self.inner.state).terminating {
            return Ok(());
        }
        self.stop_services(ctx, ids, true).await
    }

    /// Stops and forgets services, withdrawing their volume mount requests.
    pub async fn unload<S: AsRef<str>>(
        &self,
        ctx: &CancellationToken,
        ids: &[S],
    ) -> Result<(), SupervisorError> {
        let known: Vec<String> = {
            let state = lock(&self.inner.state);
            if state.terminating {
                return Ok(());
            }
            ids.iter()
                .map(AsRef::as_ref)
                .filter(|id| state.services.contains_key(*id))
                .map(str::to_string)
                .collect()
        };

        self.stop_services(ctx, &known, false).await?;

        let removed: Vec<Arc<ServiceRunner>> = {
            let mut state = lock(&self.inner.state);
            known
                .iter()
                .filter_map(|id| state.services.remove(id))
                .collect()
        };

        let mut errors = Vec::new();
        for runner in removed {
            if let Err(source) = runner.cleanup_volumes().await {
                errors.push(SupervisorError::Volumes {
                    service: runner.id().to_string(),
                    source,
                });
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SupervisorError::Aggregate(errors)),
        }
    }

    /// Stops every service, dependents first, and refuses further changes.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), SupervisorError> {
        let ids: Vec<String> = {
            let mut state = lock(&self.inner.state);
            if state.terminating {
                return Ok(());
            }
            state.terminating = true;
            state.services.keys().cloned().collect()
        };

        info!("shutting down {} services", ids.len());
        self.stop_services(ctx, &ids, true).await?;

        self.inner.tracker.close();
        tokio::select! {
            _ = self.inner.tracker.wait() => Ok(()),
            _ = ctx.cancelled() => Err(SupervisorError::Timeout),
        }
    }

    async fn stop_services<S: AsRef<str>>(
        &self,
        ctx: &CancellationToken,
        ids: &[S],
        with_rev_dependencies: bool,
    ) -> Result<(), SupervisorError> {
        let services = lock(&self.inner.state).services.clone();

        let mut targets: Vec<String> = ids
            .iter()
            .map(|id| id.as_ref().to_string())
            .filter(|id| services.contains_key(id) && self.inner.is_running(id))
            .collect();

        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        if with_rev_dependencies {
            for (id, runner) in &services {
                for dependency in runner.service().depends_on(&self.inner.runtime) {
                    reverse.entry(dependency).or_default().push(id.clone());
                }
            }

            let mut seen: HashSet<String> = targets.iter().cloned().collect();
            let mut index = 0;
            while index < targets.len() {
                let dependents = reverse.get(&targets[index]).cloned().unwrap_or_default();
                for dependent in dependents {
                    if self.inner.is_running(&dependent) && seen.insert(dependent.clone()) {
                        targets.push(dependent);
                    }
                }
                index += 1;
            }
        }

        if targets.is_empty() {
            return Ok(());
        }
        targets.sort();

        let registry = Arc::downgrade(&self.inner);
        let shutdown_timeout = self.inner.shutdown_timeout;
        let shutdowns = targets.iter().filter_map(|id| {
            let runner = services.get(id)?.clone();
            // dependents that are not running never go down on their own
            let dependents: Vec<Arc<dyn Condition>> = reverse
                .get(id)
                .into_iter()
                .flatten()
                .filter(|dependent| targets.contains(*dependent))
                .map(|dependent| wait_for_service_in(registry.clone(), StateEvent::Down, dependent.clone()))
                .collect();

            Some(async move {
                if !dependents.is_empty() {
                    let condition = all(dependents);
                    match tokio::time::timeout(shutdown_timeout, condition.wait(ctx)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => {
                            warn!("gave up on {condition} while stopping {:?}", runner.id());
                        }
                    }
                }
                runner.shutdown();
            })
        });
        join_all(shutdowns).await;

        let stopped = all(
            targets
                .iter()
                .map(|id| wait_for_service_in(registry.clone(), StateEvent::Down, id.clone())),
        );
        stopped.wait(ctx).await?;
        self.inner.wait_drivers(ctx, &targets).await?;
        Ok(())
    }

    /// Loaded services, sorted by id.
    pub fn list(&self) -> Vec<Arc<ServiceRunner>> {
        let mut runners: Vec<_> = lock(&self.inner.state).services.values().cloned().collect();
        runners.sort_by(|a, b| a.id().cmp(b.id()));
        runners
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceRunner>> {
        self.inner.runner(id)
    }

    /// The service behind `id` and whether it has a live driver task.
    pub fn is_running(&self, id: &str) -> Result<(Arc<dyn Service>, bool), SupervisorError> {
        let runner = self
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;
        Ok((Arc::clone(runner.service()), self.inner.is_running(id)))
    }

    fn check_api(&self, id: &str, operation: ApiOperation) -> Result<(), SupervisorError> {
        let (service, _) = self.is_running(id)?;
        let runtime = &self.inner.runtime;
        let allowed = match operation {
            ApiOperation::Start => service.api_start_allowed(runtime),
            ApiOperation::Stop => service.api_stop_allowed(runtime),
            ApiOperation::Restart => service.api_restart_allowed(runtime),
        };
        if allowed {
            Ok(())
        } else {
            Err(SupervisorError::NotAllowed {
                service: id.to_string(),
                operation,
            })
        }
    }

    pub fn api_start(&self, id: &str) -> Result<(), SupervisorError> {
        self.check_api(id, ApiOperation::Start)?;
        self.start(&[id])
    }

    pub async fn api_stop(&self, ctx: &CancellationToken, id: &str) -> Result<(), SupervisorError> {
        self.check_api(id, ApiOperation::Stop)?;
        self.stop(ctx, &[id]).await
    }

    /// Stops the service if it is running, then starts it again.
    pub async fn api_restart(&self, ctx: &CancellationToken, id: &str) -> Result<(), SupervisorError> {
        self.check_api(id, ApiOperation::Restart)?;
        if self.inner.is_running(id) {
            self.stop(ctx, &[id]).await?;
        }
        self.start(&[id])
    }
}
