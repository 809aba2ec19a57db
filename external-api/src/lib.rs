//! # Healthcheck & lifecycle API
//!
//! This crate provides http api's for healthcheck, diagnostics, metrics and
//! the lease lifecycle operations. It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /config
//! /leases
//! /users/{user}/lease
//! /users/{user}/lease/renew
//! /pools
//! /pools/names
//! /pools/{name}/schedulable
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use config::LeaseKeeperConfig;
use lease_manager::LeaseService;
use resource_store::ResourceStore;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, trace};
use tracing_futures::Instrument;

pub use crate::models::{Health, State};

/// requests taking longer are answered with 408
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi<S> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    service: Arc<LeaseService<S>>,
    cfg: Arc<LeaseKeeperConfig>,
}

impl<S: ResourceStore> ExternalApi<S> {
    /// Create a new ExternalApi instance
    pub fn new(
        addr: SocketAddr,
        cfg: Arc<LeaseKeeperConfig>,
        service: Arc<LeaseService<S>>,
    ) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            service,
            cfg,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    fn router(state: State, cfg: Arc<LeaseKeeperConfig>, service: Arc<LeaseService<S>>) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/config", routing::get(handlers::config))
            .route("/leases", routing::get(handlers::leases::<S>))
            .route(
                "/users/:user/lease",
                routing::post(handlers::acquire::<S>)
                    .get(handlers::status::<S>)
                    .delete(handlers::release::<S>),
            )
            .route("/users/:user/lease/renew", routing::post(handlers::renew::<S>))
            .route("/pools", routing::get(handlers::pools::<S>))
            .route("/pools/names", routing::get(handlers::pool_names::<S>))
            .route(
                "/pools/:name/schedulable",
                routing::put(handlers::set_schedulable::<S>),
            )
            .layer(Extension(state))
            .layer(Extension(service))
            .layer(Extension(cfg))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(
        addr: SocketAddr,
        state: State,
        cfg: Arc<LeaseKeeperConfig>,
        service: Arc<LeaseService<S>>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, cfg, service);

        tracing::debug!("external API listening on {}", addr);

        let shutdown = token.clone();
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        if token.is_cancelled() {
            info!("external API shut down");
            return Ok(());
        }
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let service = self.service.clone();
        let cfg = self.cfg.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(
            async move {
                tokio::select! {
                    res = ExternalApi::run(addr, state, cfg, service, token.clone()) => {
                        if let Err(err) = res {
                            error!(?err, "external API returning, this should not happen")
                        }
                    }
                    res = self.listen_status() => {
                        if let Err(err) = res {
                            error!(?err, "health task returning, this should not happen")
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("external_api", %addr)),
        )
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(CancellationToken::new()),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use config::LeaseKeeperConfig;
    use lease_manager::LeaseService;
    use leasekeeper_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use resource_store::ResourceStore;
    use tracing::{debug, error};

    use crate::models::{
        AcquireBody, Health, LeaseView, Renewed, Schedulable, ServerResult, State,
    };

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn leases<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
    ) -> ServerResult<impl IntoResponse> {
        let leases = service
            .leases()
            .iter()
            .map(|lease| LeaseView::new(lease, service.settings()))
            .collect::<Vec<_>>();
        Ok(Json(leases))
    }

    pub(crate) async fn acquire<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
        Path(user): Path<String>,
        body: Option<Json<AcquireBody>>,
    ) -> ServerResult<impl IntoResponse> {
        let request = match body {
            Some(Json(body)) => body.merge(service.default_request()),
            None => service.default_request(),
        };
        debug!(%user, ?request, "acquire requested");
        let lease = service.acquire(&user, request).await?;
        Ok((
            StatusCode::CREATED,
            Json(LeaseView::new(&lease, service.settings())),
        ))
    }

    pub(crate) async fn renew<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
        Path(user): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        let expires_at = service.renew(&user).await?;
        Ok(Json(Renewed { expires_at }))
    }

    pub(crate) async fn release<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
        Path(user): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        service.release(&user).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn status<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
        Path(user): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(service.status(&user)?.to_string())
    }

    pub(crate) async fn pools<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(service.pool_status().to_string())
    }

    pub(crate) async fn pool_names<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(Json(service.pool_names().await?))
    }

    pub(crate) async fn set_schedulable<S: ResourceStore>(
        Extension(service): Extension<Arc<LeaseService<S>>>,
        Path(name): Path<String>,
        Json(body): Json<Schedulable>,
    ) -> ServerResult<impl IntoResponse> {
        let pool = service
            .set_pool_schedulable(&name, body.schedulable)
            .await?;
        Ok(Json(pool))
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<LeaseKeeperConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        // the file on disk is served as is, env overrides are not reflected
        let path = cfg.path().context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(cfg)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API requests & responses
pub mod models {
    use axum::{http::StatusCode, response::IntoResponse};
    use chrono::{DateTime, Utc};
    use lease_manager::{AcquireRequest, LeaseError, LeaseExt, Settings};
    use parking_lot::Mutex;
    use resource_store::{Lease, Phase};
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Acquire body, anything left out comes from the configured defaults
    #[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
    pub struct AcquireBody {
        /// vCPUs
        #[serde(default)]
        pub vcpus: Option<u32>,
        /// memory in GB
        #[serde(default)]
        pub memory: Option<u32>,
        /// pool to place the lease in, empty means any
        #[serde(default)]
        pub pool: Option<String>,
        /// networks, more than one adds a network-only lease
        #[serde(default)]
        pub networks: Option<u32>,
    }

    impl AcquireBody {
        pub(crate) fn merge(self, defaults: AcquireRequest) -> AcquireRequest {
            AcquireRequest {
                vcpus: self.vcpus.unwrap_or(defaults.vcpus),
                memory: self.memory.unwrap_or(defaults.memory),
                pool: self.pool.filter(|p| !p.is_empty()).or(defaults.pool),
                networks: self.networks.unwrap_or(defaults.networks),
            }
        }
    }

    /// A lease as reported over the API. Annotations are never exposed since
    /// they carry the issued credentials.
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct LeaseView {
        /// lease name
        pub name: String,
        /// owning user
        pub owner: Option<String>,
        /// vCPUs
        pub vcpus: u32,
        /// memory in GB
        pub memory: u32,
        /// networks requested
        pub networks: u32,
        /// required pool
        pub pool: Option<String>,
        /// scheduler phase
        pub phase: Phase,
        /// renewals so far
        pub renewals: u32,
        /// only carries a network
        pub network_only: bool,
        /// when the lease will be pruned
        pub expires_at: Option<DateTime<Utc>>,
    }

    impl LeaseView {
        pub(crate) fn new(lease: &Lease, settings: &Settings) -> Self {
            Self {
                name: lease.name().to_owned(),
                owner: lease.owner().map(str::to_owned),
                vcpus: lease.spec.vcpus,
                memory: lease.spec.memory,
                networks: lease.spec.networks,
                pool: lease.spec.required_pool.clone(),
                phase: lease.status.phase,
                renewals: lease.renew_count(),
                network_only: lease.is_network_only(),
                expires_at: settings.expires_at(lease),
            }
        }
    }

    /// Renew response
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Renewed {
        /// the new expiration
        pub expires_at: DateTime<Utc>,
    }

    /// PUT /pools/{name}/schedulable body
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Schedulable {
        /// false cordons the pool
        pub schedulable: bool,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`. Lifecycle errors keep
    /// their user facing message and get a matching status code.
    #[derive(Debug)]
    pub struct ServerError {
        status: StatusCode,
        err: anyhow::Error,
    }
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl ServerError {
        /// status code the error is answered with
        pub fn status(&self) -> StatusCode {
            self.status
        }
    }

    pub(crate) fn status_for(err: &LeaseError) -> StatusCode {
        match err {
            LeaseError::AlreadyLeased | LeaseError::RenewalLimitExceeded { .. } => {
                StatusCode::CONFLICT
            }
            LeaseError::NoLease | LeaseError::PoolNotFound(_) => StatusCode::NOT_FOUND,
            LeaseError::ResourceStore(_) | LeaseError::QueueClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LeaseError::Provisioning(_) => StatusCode::BAD_GATEWAY,
        }
    }

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (self.status, format!("{}", self.err)).into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            let err = err.into();
            let status = err
                .downcast_ref::<LeaseError>()
                .map(status_for)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Self { status, err }
        }
    }
}
