//! HTTP exposition: `/metrics`, `/health` and `/-/reload` over axum.

mod handlers;

use crate::collectors::defaults::default_query_instances;
use crate::collectors::exporter::ExporterCollector;
use crate::collectors::instance::{QueryInstances, load_query_file, without_disabled};
use crate::collectors::{QueryInstanceMap, Server, ServerConfig};
use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request, header},
    routing::{get, post},
};
use prometheus::Registry;
use secrecy::SecretString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn};
use ulid::Ulid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Query group source and engine settings for [`new`].
#[derive(Clone, Debug, Default)]
pub struct ExporterOptions {
    pub config: ServerConfig,
    /// JSON query file; the built-in groups are used when absent.
    pub queries: Option<PathBuf>,
    pub disabled_queries: Vec<String>,
}

impl ExporterOptions {
    /// Read the configured query groups, minus the disabled ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the query file cannot be read or parsed.
    pub fn load_instances(&self) -> Result<QueryInstances> {
        let instances = match &self.queries {
            Some(path) => load_query_file(path)?,
            None => default_query_instances(),
        };

        Ok(without_disabled(instances, &self.disabled_queries))
    }
}

/// Shared state of the HTTP handlers.
pub struct AppState {
    server: Arc<Server>,
    exporter: ExporterCollector,
    registry: Registry,
    options: ExporterOptions,
}

impl AppState {
    /// # Errors
    ///
    /// Returns an error if the self-monitoring metrics cannot be registered.
    pub fn new(server: Arc<Server>, options: ExporterOptions) -> Result<Self> {
        let exporter = ExporterCollector::new(Arc::clone(server.scraper()));
        let registry = Registry::new();
        exporter.register_metrics(&registry)?;

        Ok(Self {
            server,
            exporter,
            registry,
            options,
        })
    }

    #[must_use]
    pub const fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

#[derive(Clone, Default)]
struct MakeRequestUlid;

impl MakeRequestId for MakeRequestUlid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Ulid::new().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let server_header = HeaderValue::from_static(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));

    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .route("/-/reload", post(handlers::reload))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    MakeRequestUlid,
                ))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        info_span!(
                            "http.request",
                            http.method = %request.method(),
                            http.route = %request.uri().path(),
                            request_id,
                            otel.kind = "server"
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID_HEADER,
                )))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::SERVER,
                    server_header,
                )),
        )
}

/// Start the exporter and serve until interrupted.
///
/// # Errors
///
/// Returns an error if the DSN is invalid, the query groups cannot be
/// loaded or the listener cannot be bound.
pub async fn new(
    port: u16,
    listen: Option<String>,
    dsn: SecretString,
    options: ExporterOptions,
) -> Result<()> {
    let instances = options.load_instances()?;
    info!(groups = instances.len(), "loaded query groups");

    let config = options.config.clone();
    let server = Arc::new(Server::connect(
        &dsn,
        config,
        Arc::new(QueryInstanceMap::new(instances)),
    )?);

    let state = Arc::new(AppState::new(Arc::clone(&server), options)?);
    let app = router(state);

    let listener = bind(port, listen.as_deref()).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    server.close().await?;
    info!("Exporter stopped");

    Ok(())
}

async fn bind(port: u16, listen: Option<&str>) -> Result<TcpListener> {
    if let Some(addr) = listen {
        let ip: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid listen address {addr}"))?;
        return TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .with_context(|| format!("failed to bind {ip}:{port}"));
    }

    // dual stack first, IPv4 when IPv6 is unavailable
    match TcpListener::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!("IPv6 bind failed ({e}), falling back to IPv4");
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
                .await
                .with_context(|| format!("failed to bind 0.0.0.0:{port}"))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
