use std::{
    any::Any,
    backtrace::Backtrace,
    fmt,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use tokio_util::sync::CancellationToken;

use super::{CycleControl, Options, Runner};
use crate::{
    constants::PANIC_STACK_LIMIT,
    error::{BoxError, ConditionError, RunnerError},
    events::{Recorder, ServiceState},
    logging::open_service_log,
    runtime::Runtime,
};

/// Body of an in-process service. It receives a token cancelled on stop, the
/// runtime and the service log.
pub type TaskFn = Arc<
    dyn Fn(CancellationToken, Arc<Runtime>, Box<dyn Write + Send>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

pub fn task_fn<F, Fut>(main: F) -> TaskFn
where
    F: Fn(CancellationToken, Arc<Runtime>, Box<dyn Write + Send>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, runtime, log| Box::pin(main(ctx, runtime, log)))
}

/// Runs a service body as a tokio task inside the supervisor.
pub struct TaskRunner {
    id: String,
    main: TaskFn,
    runtime: Arc<Runtime>,
    opts: Options,
    cycle: CycleControl,
}

impl TaskRunner {
    pub fn new(id: impl Into<String>, main: TaskFn, runtime: Arc<Runtime>, opts: Options) -> Self {
        Self {
            id: id.into(),
            main,
            runtime,
            opts,
            cycle: CycleControl::default(),
        }
    }
}

impl fmt::Display for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:?})", self.id)
    }
}

#[async_trait]
impl Runner for TaskRunner {
    async fn open(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn run(&self, recorder: Recorder) -> Result<(), RunnerError> {
        let (cycle, _guard) = self.cycle.begin();

        let log = open_service_log(
            self.opts.logging.as_ref(),
            &self.id,
            self.runtime.config().debug,
        )
        .map_err(|source| RunnerError::Log {
            id: self.id.clone(),
            source,
        })?;

        recorder(ServiceState::Running, "Service started as task".to_string());

        let body = (self.main)(cycle.stop.clone(), Arc::clone(&self.runtime), log);
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if is_cancelled(err.as_ref()) => Ok(()),
            Ok(Err(source)) => Err(RunnerError::Task {
                id: self.id.clone(),
                source,
            }),
            Err(panic) => Err(RunnerError::Panic {
                id: self.id.clone(),
                message: panic_message(panic.as_ref()),
                stack: truncated_backtrace(),
            }),
        }
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        self.cycle.stop().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

fn is_cancelled(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    err.downcast_ref::<ConditionError>()
        .is_some_and(ConditionError::is_cancelled)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncated_backtrace() -> String {
    let mut stack = Backtrace::force_capture().to_string();
    if stack.len() > PANIC_STACK_LIMIT {
        let mut end = PANIC_STACK_LIMIT;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}
