use std::{process, sync::Arc};

use qrcache::{
    cache::{BlockingPoolExecutor, CacheConfig, IndexSettingsRegistry, QueryResultCache},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState},
        telemetry,
    },
    util::bytes::format_bytes,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let executor = BlockingPoolExecutor::current()?;
    let cache = Arc::new(QueryResultCache::new(
        CacheConfig::from(&settings.cache),
        Arc::new(executor),
    ));
    let indices = Arc::new(IndexSettingsRegistry::with_enabled(
        settings.cache.enabled_indices.iter().cloned(),
    ));

    cache.start_reaper()?;
    info!(
        max_size = %settings.cache.max_size,
        max_weight = %format_bytes(settings.cache.max_weight_bytes),
        enabled_indices = indices.len(),
        "Query result cache ready"
    );
    if indices.is_empty() {
        warn!("No index has caching enabled; requests pass through until one is");
    }

    let state = AdminState {
        cache: cache.clone(),
        indices,
    };
    let result = serve_admin(&settings, state).await;

    if tokio::time::timeout(settings.server.graceful_shutdown, cache.shutdown())
        .await
        .is_err()
    {
        warn!("Sweeper did not stop within the graceful shutdown window");
    }

    result
}

async fn serve_admin(settings: &config::Settings, state: AdminState) -> Result<(), InfraError> {
    let router = http::build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;
    info!(addr = %settings.server.admin_addr, "Admin listener bound");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
