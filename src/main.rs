use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use kobold::app::{App, init_tracing};
use kobold::config::Settings;
use kobold::metrics::Metrics;
use kobold::scheduler::Scheduler;
use kobold::server::{AppState, build_router, serve};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    init_tracing(settings.log.format);

    let recorder = PrometheusBuilder::new().build_recorder();
    let prometheus = recorder.handle();
    let metrics = Metrics::new(Arc::new(recorder));

    let shutdown = CancellationToken::new();
    let App {
        catalog,
        store,
        pool,
    } = App::build(&settings, &shutdown, metrics)?;
    let scheduler = Scheduler::new(pool);

    let app = build_router(AppState::new(
        scheduler.handle(),
        store,
        catalog,
        Some(prometheus),
        shutdown.clone(),
    ));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    tracing::info!(
        handler = %settings.scheduler.handler,
        pool_size = settings.scheduler.pool_size,
        debounce_ms = settings.scheduler.debounce_ms,
        "starting scheduler"
    );

    let addr = settings.server.webhook_addr;
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    serve(listener, app, scheduler, settings.debounce(), shutdown).await?;
    tracing::info!("shutdown complete");
    Ok(())
}
