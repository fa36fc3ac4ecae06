#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use common::{Gate, TestService, completes, fails, history, states, wait_until};
use tokio_util::sync::CancellationToken;

use nodevisor::{
    conditions::{Condition, all, none},
    constants::EVENT_BUS_CAPACITY,
    error::{BoxError, SupervisorError},
    events::{EventBus, ServiceState},
    health::{Settings, health_check},
    runtime::Runtime,
    service_runner::StateEvent,
    supervisor::{Supervisor, wait_for_service},
};

const WAIT_INTERVAL: Duration = Duration::from_millis(20);

fn supervisor() -> Supervisor {
    let runtime = Runtime::default().with_events(EventBus::new(EVENT_BUS_CAPACITY));
    Supervisor::with_wait_interval(Arc::new(runtime), WAIT_INTERVAL)
}

#[tokio::test]
async fn single_service_runs_to_completion() {
    let supervisor = supervisor();
    supervisor
        .load_and_start([TestService::new("oneshot")
            .condition(none())
            .runner(completes())
            .build()])
        .unwrap();

    wait_until("oneshot to finish", || {
        matches!(supervisor.is_running("oneshot"), Ok((_, false)))
    })
    .await;

    let listed = supervisor.list();
    assert_eq!(listed.len(), 1);
    let info = listed[0].info();
    assert_eq!(info.id, "oneshot");
    assert_eq!(info.state, ServiceState::Finished);
    assert!(info.health.is_none());
    assert!(info.events.iter().all(|event| event.health.is_none()));

    assert_eq!(
        states(&listed[0]),
        vec![
            ServiceState::Waiting,
            ServiceState::Preparing,
            ServiceState::Preparing,
            ServiceState::Running,
            ServiceState::Finished,
        ]
    );
    assert_eq!(history(&listed[0])[0].message, "Waiting for nothing");
}

#[tokio::test]
async fn waiting_description_shrinks_as_conditions_hold() {
    let supervisor = supervisor();
    let c1 = Gate::new("C1");
    let c2 = Gate::new("C2");
    let condition = all([
        Arc::clone(&c1) as Arc<dyn Condition>,
        Arc::clone(&c2) as Arc<dyn Condition>,
    ]);
    supervisor
        .load_and_start([TestService::new("gated").condition(condition).build()])
        .unwrap();
    let runner = supervisor.get("gated").unwrap();

    wait_until("initial waiting event", || {
        runner.get_state() == ServiceState::Waiting
    })
    .await;
    assert_eq!(history(&runner)[0].message, "Waiting for C1, C2");

    c1.open();
    tokio::time::sleep(WAIT_INTERVAL * 3 / 2).await;
    wait_until("narrowed waiting event", || {
        history(&runner)
            .iter()
            .any(|event| event.message == "Waiting for C2")
    })
    .await;
    assert_eq!(runner.get_state(), ServiceState::Waiting);

    c2.open();
    wait_until("gated to run", || runner.get_state() == ServiceState::Running).await;

    let tail: Vec<ServiceState> = states(&runner)
        .into_iter()
        .skip_while(|state| *state == ServiceState::Waiting)
        .collect();
    assert_eq!(
        tail,
        vec![
            ServiceState::Preparing,
            ServiceState::Preparing,
            ServiceState::Running,
        ]
    );

    supervisor.shutdown(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn health_flips_become_events() {
    let supervisor = supervisor();
    let healthy = Arc::new(AtomicBool::new(true));
    let source = Arc::clone(&healthy);
    let check = health_check(move |_| {
        let source = Arc::clone(&source);
        async move {
            if source.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err::<(), BoxError>("probe failed".into())
            }
        }
    });
    let settings = Settings {
        initial_delay: Duration::from_millis(10),
        period: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
    };
    supervisor
        .load_and_start([TestService::new("probed").health(check, settings).build()])
        .unwrap();
    let runner = supervisor.get("probed").unwrap();

    let health_events = || {
        history(&runner)
            .into_iter()
            .filter_map(|event| event.health)
            .collect::<Vec<_>>()
    };

    wait_until("healthy event", || health_events().len() == 1).await;
    assert_eq!(health_events()[0].healthy, Some(true));

    healthy.store(false, Ordering::SeqCst);
    wait_until("unhealthy event", || health_events().len() == 2).await;
    let unhealthy = &health_events()[1];
    assert_eq!(unhealthy.healthy, Some(false));
    assert_eq!(unhealthy.last_message, "probe failed");
    assert_eq!(
        history(&runner).last().unwrap().message,
        "Health check failed: probe failed"
    );

    let up = wait_for_service(&supervisor, StateEvent::Up, "probed");
    let ctx = CancellationToken::new();
    let waiter = {
        let ctx = ctx.clone();
        tokio::spawn(async move { up.wait(&ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "up must not hold while unhealthy");

    healthy.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("up holds once healthy again")
        .unwrap()
        .unwrap();

    wait_until("recovered event", || health_events().len() == 3).await;
    let recovered = &health_events()[2];
    assert_eq!(recovered.healthy, Some(true));
    assert_eq!(recovered.last_message, "");

    supervisor.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn reverse_dependencies_stop_first() {
    let supervisor = supervisor();
    supervisor
        .load_and_start([
            TestService::new("a").build(),
            TestService::new("b").depends_on(&["a"]).build(),
            TestService::new("c").depends_on(&["b"]).build(),
        ])
        .unwrap();

    let ids = ["a", "b", "c"];
    wait_until("chain to run", || {
        ids.iter()
            .all(|id| supervisor.get(id).unwrap().get_state() == ServiceState::Running)
    })
    .await;

    let mut bus = supervisor.runtime().events().unwrap().subscribe();
    supervisor
        .stop_with_rev_dependencies(&CancellationToken::new(), &["a"])
        .await
        .unwrap();

    let mut down_order = Vec::new();
    while let Ok(message) = bus.try_recv() {
        if message.event.state.is_down() && !down_order.contains(&message.id) {
            down_order.push(message.id);
        }
    }
    assert_eq!(down_order, vec!["c", "b", "a"]);

    for id in ids {
        let (_, running) = supervisor.is_running(id).unwrap();
        assert!(!running, "{id} still running");
    }
}

#[tokio::test]
async fn unknown_services_are_reported_together() {
    let supervisor = supervisor();
    supervisor.load([TestService::new("known").build()]);

    match supervisor.start(&["known", "ghost", "phantom"]) {
        Err(SupervisorError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        supervisor.is_running("ghost"),
        Err(SupervisorError::UnknownService(_))
    ));

    supervisor.shutdown(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn api_restart_runs_service_again() {
    let supervisor = supervisor();
    supervisor.load([
        TestService::new("apid").api().build(),
        TestService::new("locked").build(),
    ]);
    let ctx = CancellationToken::new();

    assert!(matches!(
        supervisor.api_start("locked"),
        Err(SupervisorError::NotAllowed { .. })
    ));

    supervisor.api_start("apid").unwrap();
    let runner = supervisor.get("apid").unwrap();
    wait_until("apid to run", || runner.get_state() == ServiceState::Running).await;

    supervisor.api_restart(&ctx, "apid").await.unwrap();
    wait_until("apid to run again", || {
        history(&runner)
            .iter()
            .filter(|event| event.state == ServiceState::Running)
            .count()
            == 2
            && runner.get_state() == ServiceState::Running
    })
    .await;
    assert!(states(&runner).contains(&ServiceState::Finished));

    supervisor.api_stop(&ctx, "apid").await.unwrap();
    assert_eq!(runner.get_state(), ServiceState::Finished);
    assert!(!supervisor.is_running("apid").unwrap().1);
}

#[tokio::test]
async fn shutdown_stops_everything_and_refuses_new_work() {
    let supervisor = supervisor();
    supervisor
        .load_and_start([
            TestService::new("etcd").build(),
            TestService::new("kubelet").depends_on(&["etcd"]).build(),
        ])
        .unwrap();
    wait_until("kubelet to run", || {
        supervisor.get("kubelet").unwrap().get_state() == ServiceState::Running
    })
    .await;

    supervisor.shutdown(&CancellationToken::new()).await.unwrap();
    for runner in supervisor.list() {
        assert!(runner.get_state().is_down(), "{} not down", runner.id());
    }

    assert!(supervisor.load([TestService::new("late").build()]).is_empty());
    assert!(supervisor.get("late").is_none());
}

#[tokio::test]
async fn one_shot_and_skipped_dependencies_count_as_up() {
    let supervisor = supervisor();
    supervisor
        .load_and_start([
            TestService::new("setup").runner(completes()).build(),
            TestService::new("gap").skipped().build(),
            TestService::new("app").depends_on(&["setup", "gap"]).build(),
        ])
        .unwrap();

    let app = supervisor.get("app").unwrap();
    wait_until("app to run", || app.get_state() == ServiceState::Running).await;
    assert_eq!(
        supervisor.get("setup").unwrap().get_state(),
        ServiceState::Finished
    );
    assert_eq!(supervisor.get("gap").unwrap().get_state(), ServiceState::Skipped);

    let ctx = CancellationToken::new();
    for id in ["setup", "gap"] {
        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_service(&supervisor, StateEvent::Up, id).wait(&ctx),
        )
        .await
        .expect("up holds")
        .unwrap();
    }

    supervisor.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn failure_is_down_but_not_finished() {
    let supervisor = supervisor();
    supervisor.load([TestService::new("idle").build()]);
    supervisor
        .load_and_start([TestService::new("broken").runner(fails()).build()])
        .unwrap();

    let broken = supervisor.get("broken").unwrap();
    wait_until("broken to fail", || broken.get_state() == ServiceState::Failed).await;

    let ctx = CancellationToken::new();
    let resolves = |event, id: &str| {
        let condition = wait_for_service(&supervisor, event, id);
        let ctx = ctx.clone();
        async move {
            tokio::time::timeout(Duration::from_millis(100), condition.wait(&ctx))
                .await
                .is_ok()
        }
    };

    assert!(resolves(StateEvent::Down, "broken").await);
    assert!(!resolves(StateEvent::Finished, "broken").await);
    assert!(!resolves(StateEvent::Up, "broken").await);
    // never started
    assert!(!resolves(StateEvent::Down, "idle").await);

    supervisor.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn stopping_ignores_dependents_that_never_started() {
    let supervisor = supervisor();
    supervisor.load([
        TestService::new("base").build(),
        TestService::new("idle").depends_on(&["base"]).build(),
    ]);
    supervisor.start(&["base"]).unwrap();
    let base = supervisor.get("base").unwrap();
    wait_until("base to run", || base.get_state() == ServiceState::Running).await;

    tokio::time::timeout(
        Duration::from_secs(2),
        supervisor.stop_with_rev_dependencies(&CancellationToken::new(), &["base"]),
    )
    .await
    .expect("stop does not wait on idle")
    .unwrap();
    assert_eq!(base.get_state(), ServiceState::Finished);
    assert_eq!(
        supervisor.get("idle").unwrap().get_state(),
        ServiceState::Initialized
    );
}

#[tokio::test]
async fn circular_dependencies_give_up_after_deadline() {
    let deadline = Duration::from_millis(100);
    let runtime = Runtime::default().with_events(EventBus::new(EVENT_BUS_CAPACITY));
    let supervisor = Supervisor::with_timeouts(Arc::new(runtime), WAIT_INTERVAL, deadline);
    supervisor
        .load_and_start([
            TestService::new("left").depends_on(&["right"]).build(),
            TestService::new("right").depends_on(&["left"]).build(),
        ])
        .unwrap();

    for id in ["left", "right"] {
        let runner = supervisor.get(id).unwrap();
        wait_until("cycle to wait", || runner.get_state() == ServiceState::Waiting).await;
    }

    let started = Instant::now();
    tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.shutdown(&CancellationToken::new()),
    )
    .await
    .expect("shutdown completes once the deadline passes")
    .unwrap();
    assert!(started.elapsed() >= deadline);

    for runner in supervisor.list() {
        assert_eq!(runner.get_state(), ServiceState::Failed, "{}", runner.id());
    }
}
