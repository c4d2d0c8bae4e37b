use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use courtside::backoff::Backoff;
use courtside::clock::system_clock;
use courtside::config::Config;
use courtside::credentials::InMemoryCredentials;
use courtside::executor::CommandExecutor;
use courtside::jobs::AttemptHandler;
use courtside::lifecycle::Lifecycle;
use courtside::maintenance::{run_compactor, MaintenanceHandler};
use courtside::notify::NotifyHub;
use courtside::processor::BookingProcessor;
use courtside::scheduler::JobScheduler;
use courtside::service::BookingService;
use courtside::store::JournaledStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    courtside::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let clock = system_clock();
    let backoff = Backoff::new(config.retry_base, config.retry_cap);

    let store = Arc::new(JournaledStore::open(&config.journal_path())?);
    let stale = store.stale_processing();
    if !stale.is_empty() {
        tracing::warn!(count = stale.len(), "stale processing records need manual re-processing");
    }

    let credentials = match &config.credentials_file {
        Some(path) => InMemoryCredentials::from_file(path)?,
        None => InMemoryCredentials::new(),
    };
    let notify = Arc::new(NotifyHub::new());
    let scheduler = Arc::new(JobScheduler::new(
        clock.clone(),
        backoff,
        config.job_retention,
        config.scheduler_poll,
    ));
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        scheduler.clone(),
        notify,
        clock.clone(),
        backoff,
    ));
    let service = BookingService::new(&config, lifecycle.clone(), clock.clone());
    let processor = Arc::new(BookingProcessor::new(
        &config,
        lifecycle,
        Arc::new(CommandExecutor::new(&config.executor_cmd, config.executor_timeout)),
        Arc::new(credentials),
        clock.clone(),
    ));

    AttemptHandler::register(&scheduler, processor.clone());
    MaintenanceHandler::new(
        processor.clone(),
        Some(store.clone()),
        &scheduler,
        config.maintenance_interval,
        config.compact_threshold,
    )
    .install(&scheduler, clock.utc());

    info!("courtside started");
    info!("  journal: {}", config.journal_path().display());
    info!("  records: {}", store.len());
    info!("  timezone: {}", config.timezone);
    for court in service.get_availability().courts {
        info!(
            "  court {}: {} day window, next open date {:?}",
            court.resource_id, court.window_days, court.next_available_date
        );
    }
    info!("  max_concurrent: {}", config.max_concurrent);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(stop_rx.clone()));
    let processor_task = tokio::spawn(processor.clone().run(stop_rx.clone()));
    let compactor_task = tokio::spawn(run_compactor(
        store.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
        stop_rx,
    ));

    // Graceful shutdown: stop polling on SIGTERM/ctrl-c, let in-flight executions finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping poll loops");
    let _ = stop_tx.send(true);
    let _ = tokio::join!(scheduler_task, processor_task, compactor_task);

    info!(in_flight = processor.in_flight(), "draining executions...");
    match tokio::time::timeout(config.executor_timeout, processor.wait_idle()).await {
        Ok(()) => info!("all executions drained"),
        Err(_) => tracing::warn!(
            remaining = processor.in_flight(),
            "drain timeout, executions still running"
        ),
    }

    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("courtside stopped");
    Ok(())
}
