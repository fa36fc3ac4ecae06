#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use async_trait::async_trait;
use common::{Flaky, TestService, history, states, wait_until};
use tokio_util::sync::CancellationToken;

use nodevisor::{
    constants::EVENT_BUS_CAPACITY,
    error::BoxError,
    events::{EventBus, ServiceState},
    runner::{
        Runner,
        restart::{RestartPolicy, RestartRunner},
    },
    runtime::Runtime,
    service::Service,
    supervisor::Supervisor,
};

fn supervisor() -> Supervisor {
    let runtime = Runtime::default().with_events(EventBus::new(EVENT_BUS_CAPACITY));
    Supervisor::with_wait_interval(Arc::new(runtime), Duration::from_millis(20))
}

#[tokio::test]
async fn restart_forever_keeps_running_until_stopped() {
    let supervisor = supervisor();
    let flaky = Flaky::new(3);
    let restart = RestartRunner::new(Arc::clone(&flaky) as Arc<dyn Runner>)
        .with_policy(RestartPolicy::Forever)
        .with_interval(Duration::from_millis(1));

    supervisor
        .load_and_start([TestService::new("flaky")
            .runner(common::once(restart))
            .build()])
        .unwrap();
    let runner = supervisor.get("flaky").unwrap();

    wait_until("fifth attempt to park", || flaky.is_parked()).await;
    assert!(flaky.runs() >= 4);

    let cycle: Vec<ServiceState> = states(&runner)
        .into_iter()
        .filter(|state| matches!(state, ServiceState::Running | ServiceState::Waiting))
        .collect();
    assert!(
        cycle
            .iter()
            .filter(|state| **state == ServiceState::Running)
            .count()
            >= 4
    );
    assert!(
        cycle
            .windows(2)
            .all(|pair| !(pair[0] == ServiceState::Running && pair[1] == ServiceState::Running)),
        "restarts must be announced: {cycle:?}"
    );

    let messages: Vec<String> = history(&runner).into_iter().map(|e| e.message).collect();
    assert!(messages.contains(
        &"Error running Flaky, going to restart forever: failed".to_string()
    ));
    assert!(messages.contains(&"Service exited without error, going to restart".to_string()));

    supervisor
        .stop(&CancellationToken::new(), &["flaky"])
        .await
        .unwrap();
    assert_eq!(runner.get_state(), ServiceState::Finished);
}

#[tokio::test]
async fn post_hook_sees_every_run() {
    let supervisor = supervisor();
    let service = Arc::new(TestService::new("hooked").runner(common::completes()));
    supervisor
        .load_and_start([Arc::clone(&service) as Arc<dyn Service>])
        .unwrap();

    wait_until("first run", || service.post_calls.load(Ordering::SeqCst) == 1).await;
    wait_until("driver exit", || {
        !supervisor.is_running("hooked").unwrap().1
    })
    .await;

    supervisor.start(&["hooked"]).unwrap();
    wait_until("second run", || service.post_calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(supervisor.get("hooked").unwrap().get_state(), ServiceState::Finished);
}

struct Nothing;

#[async_trait]
impl Service for Nothing {
    fn id(&self, _runtime: &Runtime) -> String {
        "nothing".into()
    }

    fn runner(&self, _runtime: &Arc<Runtime>) -> Result<Option<Box<dyn Runner>>, BoxError> {
        Ok(None)
    }
}

#[tokio::test]
async fn service_without_runner_is_skipped() {
    let supervisor = supervisor();
    let mut bus = supervisor.runtime().events().unwrap().subscribe();
    supervisor.load_and_start([Arc::new(Nothing) as Arc<dyn Service>]).unwrap();

    let runner = supervisor.get("nothing").unwrap();
    wait_until("skip", || runner.get_state() == ServiceState::Skipped).await;
    assert_eq!(history(&runner).last().unwrap().message, "Service skipped");

    let published = bus.recv().await.unwrap();
    assert_eq!(published.id, "nothing");
    assert_eq!(published.event.state, ServiceState::Preparing);
}

struct BrokenPre;

#[async_trait]
impl Service for BrokenPre {
    fn id(&self, _runtime: &Runtime) -> String {
        "broken".into()
    }

    async fn pre_func(&self, _ctx: &CancellationToken, _runtime: &Runtime) -> Result<(), BoxError> {
        Err("no certificates".into())
    }

    fn runner(&self, _runtime: &Arc<Runtime>) -> Result<Option<Box<dyn Runner>>, BoxError> {
        Ok(None)
    }
}

#[tokio::test]
async fn pre_stage_failure_fails_service() {
    let supervisor = supervisor();
    supervisor.load_and_start([Arc::new(BrokenPre) as Arc<dyn Service>]).unwrap();

    let runner = supervisor.get("broken").unwrap();
    wait_until("failure", || runner.get_state() == ServiceState::Failed).await;
    assert_eq!(
        history(&runner).last().unwrap().message,
        "Failed to run pre stage: no certificates"
    );
}
