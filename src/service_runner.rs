//! Per-service driver: walks one service through its lifecycle and records every
//! transition.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    conditions::{Condition, all},
    constants::{HEALTH_SUBSCRIBER_BUFFER, MAX_EVENTS_TO_KEEP, WAIT_CONDITION_CHECK_INTERVAL},
    error::{ConditionError, ServiceError, StoreError},
    events::{Recorder, ServiceEvent, ServiceEventMessage, ServiceEvents, ServiceState},
    health::{self, HealthState, HealthStatus, StateChange},
    resources::volume::{
        create_volume_mount_request, delete_volume_mount_requests, requester,
        wait_for_volume_to_be_mounted,
    },
    runner::Runner,
    runtime::Runtime,
    service::Service,
    supervisor::{Registry, wait::wait_for_service_in},
    util::lock,
};

/// Coarse readiness signal derived from the service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StateEvent {
    /// Skipped or finished, or running and healthy if the service is health-checked.
    Up,
    /// Finished, failed or skipped.
    Down,
    /// Finished only.
    Finished,
}

/// Serializable snapshot of a service for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub id: String,
    pub state: ServiceState,
    pub events: Vec<ServiceEvent>,
    pub discarded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

#[derive(Default)]
struct Inner {
    state: ServiceState,
    events: ServiceEvents,
    subscribers: HashMap<StateEvent, Vec<mpsc::Sender<()>>>,
}

pub struct ServiceRunner {
    id: String,
    service: Arc<dyn Service>,
    runtime: Arc<Runtime>,
    registry: Weak<Registry>,
    inner: Mutex<Inner>,
    health: Arc<HealthState>,
    cancel: Mutex<CancellationToken>,
    volume_requests: Mutex<Vec<String>>,
    wait_interval: Duration,
}

impl ServiceRunner {
    pub(crate) fn new(
        service: Arc<dyn Service>,
        runtime: Arc<Runtime>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id: service.id(&runtime),
            service,
            runtime,
            registry,
            inner: Mutex::new(Inner::default()),
            health: Arc::new(HealthState::default()),
            cancel: Mutex::new(CancellationToken::new()),
            volume_requests: Mutex::new(Vec::new()),
            wait_interval: WAIT_CONDITION_CHECK_INTERVAL,
        }
    }

    pub(crate) fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn get_state(&self) -> ServiceState {
        lock(&self.inner).state
    }

    /// Up to `count` most recent events, oldest first.
    pub fn get_event_history(&self, count: usize) -> Vec<ServiceEvent> {
        lock(&self.inner).events.get(count)
    }

    pub fn info(&self) -> ServiceInfo {
        let inner = lock(&self.inner);
        ServiceInfo {
            id: self.id.clone(),
            state: inner.state,
            events: inner.events.get(MAX_EVENTS_TO_KEEP),
            discarded: inner.events.discarded(),
            health: self.is_healthchecked().then(|| self.health.get()),
        }
    }

    fn is_healthchecked(&self) -> bool {
        self.service.healthcheck().is_some()
    }

    fn holds(&self, state: ServiceState, event: StateEvent) -> bool {
        match event {
            StateEvent::Up => match state {
                ServiceState::Skipped | ServiceState::Finished => true,
                ServiceState::Running => {
                    !self.is_healthchecked() || self.health.get().healthy == Some(true)
                }
                _ => false,
            },
            StateEvent::Down => state.is_down(),
            StateEvent::Finished => state == ServiceState::Finished,
        }
    }

    /// Senders whose event holds in the current state.
    fn ready_subscribers(&self, inner: &Inner) -> Vec<mpsc::Sender<()>> {
        inner
            .subscribers
            .iter()
            .filter(|(event, _)| self.holds(inner.state, **event))
            .flat_map(|(_, senders)| senders.iter().cloned())
            .collect()
    }

    fn record(&self, event: ServiceEvent) {
        let ready = {
            let mut inner = lock(&self.inner);
            inner.state = event.state;
            inner.events.push(event.clone());
            self.ready_subscribers(&inner)
        };

        info!("service[{}]({}): {}", self.id, event.state, event.message);

        if let Some(bus) = self.runtime.events() {
            bus.publish(ServiceEventMessage {
                id: self.id.clone(),
                event,
            });
        }

        for subscriber in ready {
            let _ = subscriber.try_send(());
        }
    }

    pub fn update_state(&self, state: ServiceState, message: impl Into<String>) {
        self.record(ServiceEvent::new(state, message));
    }

    /// Turns a health flip into a `Running` event; ignored outside `Running`.
    fn health_update(&self, change: StateChange) {
        if self.get_state() != ServiceState::Running {
            return;
        }

        let message = if change.new.healthy == Some(true) {
            "Health check successful".to_string()
        } else {
            format!("Health check failed: {}", change.new.last_message)
        };

        self.record(ServiceEvent {
            message,
            state: ServiceState::Running,
            health: Some(change.new),
            timestamp: Utc::now(),
        });
    }

    /// Registers `subscriber` for `event`. It is signalled right away if the event already holds.
    pub fn subscribe(&self, event: StateEvent, subscriber: mpsc::Sender<()>) {
        let mut inner = lock(&self.inner);
        if self.holds(inner.state, event) {
            let _ = subscriber.try_send(());
        }
        inner.subscribers.entry(event).or_default().push(subscriber);
    }

    pub fn unsubscribe(&self, event: StateEvent, subscriber: &mpsc::Sender<()>) {
        let mut inner = lock(&self.inner);
        if let Some(senders) = inner.subscribers.get_mut(&event) {
            senders.retain(|s| !s.same_channel(subscriber));
        }
    }

    /// Cancels the running lifecycle, if any.
    pub fn shutdown(&self) {
        lock(&self.cancel).cancel();
    }

    /// Drives the service once through its lifecycle. Returns when the service
    /// reaches a terminal state; it may be started again afterwards.
    pub async fn start(self: &Arc<Self>) {
        let ctx = lock(&self.cancel).clone();

        self.lifecycle(&ctx).await;

        *lock(&self.cancel) = CancellationToken::new();
    }

    async fn lifecycle(self: &Arc<Self>, ctx: &CancellationToken) {
        if let Err(err) = self.prepare(ctx).await {
            self.update_state(ServiceState::Failed, err.to_string());
            return;
        }

        self.update_state(ServiceState::Preparing, "Creating service runner");
        let runner = match self.service.runner(&self.runtime) {
            Ok(runner) => runner,
            Err(err) => {
                self.update_state(
                    ServiceState::Failed,
                    ServiceError::CreateRunner(err).to_string(),
                );
                return;
            }
        };

        match runner {
            None => self.update_state(ServiceState::Skipped, "Service skipped"),
            Some(runner) => match self.run(ctx, runner).await {
                Ok(()) => self.update_state(ServiceState::Finished, "Service finished successfully"),
                Err(err) => self.update_state(ServiceState::Failed, err.to_string()),
            },
        }

        if let Err(err) = self.service.post_func(&self.runtime, self.get_state()).await {
            self.update_state(ServiceState::Failed, ServiceError::PostStage(err).to_string());
        }
    }

    /// Waits for the start condition, then runs the pre hook.
    async fn prepare(&self, ctx: &CancellationToken) -> Result<(), ServiceError> {
        if let Some(condition) = self.start_condition().await? {
            self.wait_for(ctx, condition)
                .await
                .map_err(ServiceError::Condition)?;
        }

        self.update_state(ServiceState::Preparing, "Running pre state");
        self.service
            .pre_func(ctx, &self.runtime)
            .await
            .map_err(ServiceError::PreStage)
    }

    /// Dependencies first, then volumes, then the service's own condition.
    async fn start_condition(&self) -> Result<Option<Arc<dyn Condition>>, ServiceError> {
        let mut conditions: Vec<Arc<dyn Condition>> = self
            .service
            .depends_on(&self.runtime)
            .into_iter()
            .map(|dep| wait_for_service_in(self.registry.clone(), StateEvent::Up, dep))
            .collect();

        let volumes = self.service.volumes(&self.runtime);
        if !volumes.is_empty() && !self.runtime.config().in_container {
            let store = Arc::clone(self.runtime.state());
            let requester = requester(&self.id);
            for volume in volumes {
                let request_id = create_volume_mount_request(store.as_ref(), &requester, &volume)
                    .await
                    .map_err(ServiceError::VolumeRequest)?;
                {
                    let mut requests = lock(&self.volume_requests);
                    if !requests.contains(&request_id) {
                        requests.push(request_id.clone());
                    }
                }
                conditions.push(wait_for_volume_to_be_mounted(
                    Arc::clone(&store),
                    request_id,
                    volume,
                ));
            }
        }

        if let Some(condition) = self.service.condition(&self.runtime) {
            conditions.push(condition);
        }

        Ok(match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(all(conditions)),
        })
    }

    /// Waits on `condition`, re-announcing its description whenever it changes.
    async fn wait_for(
        &self,
        ctx: &CancellationToken,
        condition: Arc<dyn Condition>,
    ) -> Result<(), ConditionError> {
        let mut description = condition.to_string();
        self.update_state(ServiceState::Waiting, format!("Waiting for {description}"));

        let wait = condition.wait(ctx);
        tokio::pin!(wait);

        let mut ticker = tokio::time::interval(self.wait_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut wait => return result,
                _ = ticker.tick() => {
                    let current = condition.to_string();
                    if !current.is_empty() && current != description {
                        description = current;
                        self.update_state(
                            ServiceState::Waiting,
                            format!("Waiting for {description}"),
                        );
                    }
                }
            }
        }
    }

    fn recorder(self: &Arc<Self>) -> Recorder {
        let this = Arc::clone(self);
        Arc::new(move |state, message| {
            this.update_state(state, message);
            if state != ServiceState::Running && this.is_healthchecked() {
                this.health.update(false, "service not running");
            }
        })
    }

    async fn run(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        runner: Box<dyn Runner>,
    ) -> Result<(), ServiceError> {
        runner.open().await.map_err(ServiceError::Open)?;

        let result = self.run_open(ctx, runner.as_ref()).await;

        if let Err(err) = runner.close().await {
            warn!("service[{}]: failed to close {runner}: {err}", self.id);
        }
        result
    }

    async fn run_open(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        runner: &dyn Runner,
    ) -> Result<(), ServiceError> {
        let health_ctx = ctx.child_token();
        let _health_guard = health_ctx.clone().drop_guard();

        let (health_tx, mut health_rx) = mpsc::channel(HEALTH_SUBSCRIBER_BUFFER);
        if let Some(checked) = self.service.healthcheck() {
            let check = checked.health_func(&self.runtime);
            let settings = checked.health_settings(&self.runtime);
            let state = Arc::clone(&self.health);
            let health_ctx = health_ctx.clone();

            self.health.subscribe(health_tx.clone());
            tokio::spawn(async move {
                let _ = health::run(&health_ctx, &settings, &state, &check).await;
            });
        }

        let run = runner.run(self.recorder());
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result.map_err(ServiceError::Run),
                Some(change) = health_rx.recv() => self.health_update(change),
                _ = ctx.cancelled() => {
                    let (stopped, result) = tokio::join!(runner.stop(), &mut run);
                    break match stopped {
                        Err(err) => Err(ServiceError::Stop(err)),
                        Ok(()) => result.map_err(ServiceError::Run),
                    };
                }
            }
        };

        self.health.unsubscribe(&health_tx);
        result
    }

    /// Withdraws the volume mount requests made by previous starts.
    pub async fn cleanup_volumes(&self) -> Result<(), StoreError> {
        let requests = std::mem::take(&mut *lock(&self.volume_requests));
        if requests.is_empty() {
            return Ok(());
        }
        delete_volume_mount_requests(self.runtime.state().as_ref(), &requests).await
    }
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRunner")
            .field("id", &self.id)
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}
