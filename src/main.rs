use std::{future::IntoFuture, process, sync::Arc};

use fetchward::{
    cache::{CacheConfig, CacheStorage, FetchRequest, PartitionNames},
    config,
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, ProxyState},
        network::HttpNetwork,
        runtime::{Runtime, open_backend},
        telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Fetch(args) => run_fetch(settings, args).await,
        config::Command::Partitions(_) => run_partitions(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let network = Arc::new(HttpNetwork::new(settings.upstream.transport_timeout)?);
    let runtime = Runtime::build(&settings, network).await?;

    let lifecycle = runtime.interceptor.lifecycle();
    let installed = lifecycle.install().await.map_err(InfraError::from)?;
    let activated = lifecycle.activate().await.map_err(InfraError::from)?;
    info!(
        target = "fetchward::lifecycle",
        version = %settings.cache.version,
        cached = installed.cached.len(),
        skipped = installed.skipped.len(),
        deleted = activated.deleted.len(),
        "Engine active"
    );

    // Periodic metrics broadcast
    let broadcast_handle = runtime
        .telemetry
        .spawn_periodic(settings.telemetry.broadcast_interval);

    let state = ProxyState {
        interceptor: runtime.interceptor.clone(),
        sync: runtime.sync.clone(),
        origin: settings.upstream.origin.clone(),
    };
    let result = serve_http(&settings, state).await;

    broadcast_handle.abort();
    let _ = broadcast_handle.await;

    if !runtime.outbox.is_empty() {
        warn!(
            pending = runtime.outbox.len(),
            "Shutting down with deferred writes still queued"
        );
    }

    result
}

async fn serve_http(settings: &config::Settings, state: ProxyState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        addr = %settings.server.addr,
        origin = %settings.upstream.origin,
        "Proxy listening"
    );

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.notified().await }
        })
        .into_future();
    tokio::pin!(server);

    let outcome = tokio::select! {
        result = &mut server => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested; draining connections");
            shutdown.notify_one();
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        grace_seconds = settings.server.graceful_shutdown.as_secs(),
                        "Graceful shutdown timed out"
                    );
                    Ok(())
                }
            }
        }
    };

    outcome.map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn run_fetch(settings: config::Settings, args: config::FetchArgs) -> Result<(), AppError> {
    let url = resolve_target(&settings.upstream.origin, &args.url)?;
    let network = Arc::new(HttpNetwork::new(settings.upstream.transport_timeout)?);
    let runtime = Runtime::build(&settings, network).await?;
    runtime
        .interceptor
        .lifecycle()
        .activate()
        .await
        .map_err(InfraError::from)?;

    let request = if args.navigate {
        FetchRequest::navigate(url)
    } else {
        FetchRequest::get(url)
    };
    let route = runtime.interceptor.classifier().classify_request(&request);
    let response = runtime.interceptor.handle(request).await?;

    println!("{} ({} -> {})", response.status, route.strategy, route.partition);
    for (name, value) in &response.headers {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    println!();
    println!("{}", String::from_utf8_lossy(&response.body));
    Ok(())
}

async fn run_partitions(settings: config::Settings) -> Result<(), AppError> {
    let backend = open_backend(&settings.cache).await?;
    let config = CacheConfig::from(&settings);
    let storage = CacheStorage::new(backend, PartitionNames::new(config.prefix, config.version));
    let summary = storage.summary().await.map_err(InfraError::from)?;

    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::unexpected(format!("failed to render partitions: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn resolve_target(origin: &Url, target: &str) -> Result<Url, AppError> {
    match Url::parse(target) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => origin
            .join(target)
            .map_err(|err| AppError::validation(format!("invalid url `{target}`: {err}"))),
        Err(err) => Err(AppError::validation(format!("invalid url `{target}`: {err}"))),
    }
}
