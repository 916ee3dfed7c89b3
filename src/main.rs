//! AxoCal server binary.
//!
//! This crate serves a calendar tree over WebDAV. Every mutating request is
//! checked against the client-visible lock table and runs under a
//! request-scoped temporary lock. The main entry point builds the Axum
//! router, configures optional TLS, and starts the listeners.

mod auth;
mod background;
mod config;
mod dav_lock;
mod error;
mod http;
mod if_header;
mod lock_guard;
mod lock_node;
mod lock_path;
mod lock_space;
mod locks_api;
mod logging;
mod tls;
mod webdav;

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{any, get};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use dav_server::{DavHandler, localfs::LocalFs};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::AuthConfig;
use crate::background::spawn_lock_sweeper;
use crate::config::{Args, WEBDAV_PREFIX};
use crate::dav_lock::LockTimeouts;
use crate::http::build_cors_layer;
use crate::lock_space::LockSpace;
use crate::webdav::WebDavSettings;

/// Starts the AxoCal server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage_root = PathBuf::from(&args.storage_dir);
    tokio::fs::create_dir_all(&storage_root).await?;

    let auth_config = Arc::new(AuthConfig {
        username: args.auth_user.clone(),
        password: args.auth_pass.clone(),
        enabled: !args.no_auth,
    });
    if args.no_auth {
        warn!("authentication disabled, locks are owned by anonymous");
    }

    let locks = Arc::new(LockSpace::new(args.lock_cleanup_threshold));
    let settings = Arc::new(WebDavSettings {
        prefix: WEBDAV_PREFIX.to_string(),
        request_lock_timeout: Duration::from_secs(args.request_lock_timeout_secs),
        timeouts: LockTimeouts {
            default: Duration::from_secs(args.lock_default_timeout_secs),
            max: Duration::from_secs(args.lock_max_timeout_secs),
        },
    });
    let dav_handler = Arc::new(
        DavHandler::builder()
            .strip_prefix(WEBDAV_PREFIX)
            .filesystem(LocalFs::new(&storage_root, false, false, false))
            .build_handler(),
    );

    let mut app = Router::new()
        .route("/webdav", any(webdav::webdav_handler))
        .route("/webdav/{*path}", any(webdav::webdav_handler))
        .route("/api/locks", get(locks_api::list_locks))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.split(',').next())
                        .map(|s| s.trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(auth_config))
        .layer(Extension(locks.clone()))
        .layer(Extension(settings))
        .layer(Extension(dav_handler));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    spawn_lock_sweeper(locks, Duration::from_secs(args.lock_sweep_interval_secs.max(1)));

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    if args.tls {
        let https_addr = SocketAddr::new(host, args.https_port);
        let tls_config = tls::build_rustls_config(&args, host).await?;
        info!("🔒 Starting HTTPS server at {}", https_addr);
        let https_server = axum_server::bind_rustls(https_addr, tls_config)
            .handle(handle.clone())
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        tokio::select! {
            result = http_server => result?,
            result = https_server => result?,
            _ = shutdown_signal(handle) => {}
        }
    } else {
        tokio::select! {
            result = http_server => result?,
            _ = shutdown_signal(handle) => {}
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
