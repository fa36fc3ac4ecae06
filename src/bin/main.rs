use std::{error::Error, path::Path, sync::Arc};

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodevisor::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    constants::{EVENT_BUS_CAPACITY, SHUTDOWN_TIMEOUT},
    events::EventBus,
    logging::{FileLoggingManager, init_tracing, tail},
    reaper,
    runtime::{Runtime, RuntimeMode},
    service::Service,
    supervisor::Supervisor,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run {
            config,
            service,
            reap,
        } => run(&config, &service, reap).await?,
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            for service in config.services()? {
                let manifest = service.manifest();
                if manifest.depends_on.is_empty() {
                    println!("{}", manifest.id);
                } else {
                    println!("{} (after {})", manifest.id, manifest.depends_on.join(", "));
                }
            }
        }
        Commands::Logs {
            config,
            service,
            lines,
        } => {
            let config = load_config(&config)?;
            let logs = FileLoggingManager::new(config.log_dir(RuntimeMode::detect()));
            let path = logs.log_path(&service);
            info!("Fetching logs for service: {service}");
            for line in tail(&path, lines)? {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    init_tracing(args.log_level.map(|level| level.as_str()));
}

async fn run(config_path: &Path, only: &[String], reap: bool) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;
    let services = config.services()?;

    if reap || std::process::id() == 1 {
        reaper::start()?;
    }

    let log_dir = config.log_dir(RuntimeMode::detect());
    info!("Writing service logs to {}", log_dir.display());

    let runtime = Runtime::new(config.runtime_config())
        .with_logging(Arc::new(FileLoggingManager::new(log_dir)))
        .with_events(EventBus::new(EVENT_BUS_CAPACITY));
    let supervisor = Supervisor::instance(Arc::new(runtime));

    let ids = supervisor.load(
        services
            .into_iter()
            .map(|service| Arc::new(service) as Arc<dyn Service>),
    );
    if only.is_empty() {
        supervisor.start(&ids)?;
    } else {
        supervisor.start(only)?;
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    let ctx = CancellationToken::new();
    let deadline = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
            warn!("shutdown is taking longer than {SHUTDOWN_TIMEOUT:?}; giving up");
            ctx.cancel();
        })
    };

    let result = supervisor.shutdown(&ctx).await;
    deadline.abort();
    if let Err(err) = &result {
        error!("shutdown failed: {err}");
    }
    result?;

    info!("all services stopped");
    Ok(())
}
