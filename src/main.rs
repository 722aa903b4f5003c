//! tohttps server binary.
//!
//! Serves a static site out of a root directory, with password-gated upload,
//! delete and mkdir operations, chunked range-aware downloads, a persistent
//! visit counter and a two-level request-rate guard. The main entry point
//! builds the Axum router, configures TLS, and starts HTTP/HTTPS listeners.

mod admin;
mod atomic;
mod background;
mod compression;
mod config;
mod counter;
mod error;
mod guard;
mod http;
mod logging;
mod path;
mod site;
mod storage;
mod tls;
mod transfer;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::admin::AdminConfig;
use crate::background::spawn_background_tasks;
use crate::config::{
    Args, COUNTER_SIZE, GUARD_RESET_PATH, SHUTDOWN_GRACE_SECS, VISITS_DB_FILE,
};
use crate::counter::PersistentCounter;
use crate::guard::RateGuard;
use crate::http::{build_cors_layer, client_identifier};
use crate::path::PathResolver;
use crate::storage::FileStore;
use crate::transfer::TransferEngine;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let root = std::path::absolute(&args.root_dir)?;
    let trash = std::path::absolute(&args.trash_dir)?;
    let runtime_dir = std::path::absolute(&args.runtime_dir)?;
    tokio::fs::create_dir_all(&runtime_dir).await?;

    let store = Arc::new(FileStore::new(trash));
    store.ensure_dirs(&root).await?;
    let resolver = Arc::new(PathResolver::new(root));
    let engine = Arc::new(TransferEngine::new(
        store.clone(),
        args.chunk_size,
        args.cache_max_age,
    ));
    let counter = Arc::new(PersistentCounter::open(
        &runtime_dir.join(VISITS_DB_FILE),
        COUNTER_SIZE,
    ));
    let guard = Arc::new(RateGuard::new(
        args.max_requests_per_second,
        args.attack_threshold,
    ));
    let admin = Arc::new(AdminConfig {
        password: args.admin_password.clone(),
        max_upload_size: args.max_file_size,
    });
    info!(
        root = ?resolver.root(),
        trash = ?store.trash_path(),
        visits = counter.get(),
        counter_enabled = counter.is_enabled(),
        "site ready"
    );

    let services = Services {
        resolver,
        store,
        engine,
        counter,
        guard,
        admin,
    };
    let app = build_router(services.clone(), args.cors_origins.as_deref());
    let Services { guard, counter, .. } = services;

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config = tls::build_rustls_config(&args, host, &runtime_dir).await?;
            info!("🔒 Starting HTTPS server at {}", https_addr);
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => None,
    };
    let https_server = async move {
        match https_server {
            Some(server) => server.await,
            None => Ok(()),
        }
    };

    spawn_background_tasks(guard, counter.clone());
    tokio::spawn(shutdown_signal(handle));
    tokio::try_join!(http_server, https_server)?;

    let visits = counter.get();
    let flushed = match Arc::try_unwrap(counter) {
        Ok(counter) => counter.close(true),
        Err(counter) => counter.flush(),
    };
    match flushed {
        Ok(()) => info!(visits, "visit counter flushed"),
        Err(err) => warn!(error = %err, "final visit counter flush failed"),
    }
    Ok(())
}

/// Shared handles injected into every request as `Extension`s.
#[derive(Clone)]
struct Services {
    resolver: Arc<PathResolver>,
    store: Arc<FileStore>,
    engine: Arc<TransferEngine>,
    counter: Arc<PersistentCounter>,
    guard: Arc<RateGuard>,
    admin: Arc<AdminConfig>,
}

/// Builds the full application: route table plus the middleware stack.
fn build_router(services: Services, cors_origins: Option<&str>) -> Router {
    with_layers(routes(), services, cors_origins)
}

fn routes() -> Router {
    let site_routes = get(site::serve)
        .post(admin::dispatch)
        .put(upload::put_upload)
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/api/visits", get(site::visits))
        .route("/api/version", get(version::get_version_info))
        .route(GUARD_RESET_PATH, post(admin::reset_guard))
        .route("/", site_routes.clone())
        .route("/{*path}", site_routes)
}

/// Wraps `router` in the guard, security headers, panic catcher, tracing,
/// shared state and optional CORS, innermost first.
fn with_layers(router: Router, services: Services, cors_origins: Option<&str>) -> Router {
    let app = router
        .layer(middleware::from_fn(guard::guard_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = client_identifier(request.headers(), connect_ip);

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(services.resolver))
        .layer(Extension(services.store))
        .layer(Extension(services.engine))
        .layer(Extension(services.counter))
        .layer(Extension(services.guard))
        .layer(Extension(services.admin));

    match build_cors_layer(cors_origins) {
        Some(cors_layer) => app.layer(cors_layer),
        None => app,
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
