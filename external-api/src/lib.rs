//! # Healthcheck & control API
//!
//! HTTP surface for healthchecks and lease administration:
//!
//! /health
//! /ping
//! /leases
//! /leases/{mac}
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

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use lease_manager::LeaseStore;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalApi`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Serves health state plus a small REST surface over the lease store,
/// so operators can inspect, pin, and delete bindings while the server
/// runs.
#[derive(Debug)]
pub struct ExternalApi<S> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    store: Arc<S>,
}

impl<S: LeaseStore> ExternalApi<S> {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, store: Arc<S>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            store,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(
        addr: SocketAddr,
        state: State,
        store: Arc<S>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        // Provides:
        // /health
        // /ping
        // /leases
        // /leases/{mac}
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route(
                "/leases",
                routing::get(handlers::leases::<S>).post(handlers::set_lease::<S>),
            )
            .route(
                "/leases/:mac",
                routing::get(handlers::get_lease::<S>).delete(handlers::delete_lease::<S>),
            )
            .layer(Extension(state))
            .layer(Extension(store));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let store = Arc::clone(&self.store);
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            tokio::select! {
                res = Self::run(addr, state, store, token) => {
                    if let Err(err) = res {
                        error!(?err, "external API exited with error");
                    }
                }
                _ = self.listen_status() => {}
            }
        })
    }

    /// Start the external api, aborting it when the guard drops
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

mod handlers {
    use std::sync::Arc;

    use axum::{
        extract::{Extension, Json, Path, rejection::JsonRejection},
        http::StatusCode,
        response::IntoResponse,
    };
    use lease_manager::LeaseStore;
    use pnet::util::MacAddr;

    use crate::models::{ApiResult, Health, LeaseEntry, NewLease, State, bad_request, store_err};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ApiResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn leases<S: LeaseStore>(
        Extension(store): Extension<Arc<S>>,
    ) -> ApiResult<impl IntoResponse> {
        let leases = store.list_leases().await.map_err(store_err)?;
        Ok(Json(
            leases.into_iter().map(LeaseEntry::from).collect::<Vec<_>>(),
        ))
    }

    pub(crate) async fn get_lease<S: LeaseStore>(
        Path(mac): Path<String>,
        Extension(store): Extension<Arc<S>>,
    ) -> ApiResult<impl IntoResponse> {
        let mac = parse_mac(&mac)?;
        let lease = store.get_lease(mac).await.map_err(store_err)?;
        Ok(Json(LeaseEntry::from(lease)))
    }

    pub(crate) async fn set_lease<S: LeaseStore>(
        Extension(store): Extension<Arc<S>>,
        body: Result<Json<NewLease>, JsonRejection>,
    ) -> ApiResult<impl IntoResponse> {
        // a body that doesn't deserialize is the caller's 400, not a 422
        let Json(new) = body.map_err(|err| bad_request(format!("invalid lease body: {err}")))?;
        let mac = parse_mac(&new.mac)?;
        let (lease_end, grace_end) = new.window()?;
        store
            .set_lease(mac, new.ip, false, new.persistent, lease_end, grace_end)
            .await
            .map_err(store_err)?;
        Ok(StatusCode::CREATED)
    }

    pub(crate) async fn delete_lease<S: LeaseStore>(
        Path(mac): Path<String>,
        Extension(store): Extension<Arc<S>>,
    ) -> ApiResult<impl IntoResponse> {
        let mac = parse_mac(&mac)?;
        store.remove_lease(mac).await.map_err(store_err)?;
        Ok(StatusCode::NO_CONTENT)
    }

    fn parse_mac(mac: &str) -> Result<MacAddr, crate::models::ApiError> {
        mac.parse::<MacAddr>()
            .map_err(|err| bad_request(format!("invalid mac {mac:?}: {err:?}")))
    }
}

/// Various models for API requests & responses
pub mod models {
    use std::{
        fmt,
        net::Ipv4Addr,
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use axum::{http::StatusCode, response::IntoResponse};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

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

    /// One lease as the API reports it, timestamps in unix seconds
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct LeaseEntry {
        /// client hardware address
        pub mac: String,
        /// bound address
        pub ip: Ipv4Addr,
        /// allocated by the server rather than set through this API
        pub dynamic: bool,
        /// exempt from reclamation
        pub persistent: bool,
        /// lease expiry, unix seconds
        pub lease_end: i64,
        /// grace deadline, unix seconds
        pub grace_end: i64,
    }

    impl From<lease_manager::Lease> for LeaseEntry {
        fn from(lease: lease_manager::Lease) -> Self {
            Self {
                mac: lease.mac.to_string(),
                ip: lease.ip,
                dynamic: lease.dynamic,
                persistent: lease.persistent,
                lease_end: epoch(lease.lease_end),
                grace_end: epoch(lease.grace_end),
            }
        }
    }

    /// Body of `POST /leases`
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct NewLease {
        /// client hardware address
        pub mac: String,
        /// address to bind
        pub ip: Ipv4Addr,
        /// exempt the lease from reclamation
        #[serde(default)]
        pub persistent: bool,
        /// lease expiry, unix seconds
        pub lease_end: i64,
        /// grace deadline, unix seconds; defaults to `lease_end`
        #[serde(default)]
        pub grace_end: Option<i64>,
    }

    impl NewLease {
        /// validated (lease_end, grace_end) pair
        pub fn window(&self) -> Result<(SystemTime, SystemTime), ApiError> {
            let grace = self.grace_end.unwrap_or(self.lease_end);
            if grace < self.lease_end {
                return Err(bad_request(format!(
                    "grace_end {grace} precedes lease_end {}",
                    self.lease_end
                )));
            }
            Ok((to_systime(self.lease_end), to_systime(grace)))
        }
    }

    fn epoch(time: SystemTime) -> i64 {
        time.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64
    }

    fn to_systime(secs: i64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
    }

    /// An error with the HTTP status it maps to
    #[derive(Debug)]
    pub struct ApiError {
        status: StatusCode,
        err: anyhow::Error,
    }

    /// handler result type
    pub type ApiResult<T> = Result<T, ApiError>;

    impl IntoResponse for ApiError {
        fn into_response(self) -> axum::response::Response {
            (self.status, format!("{}", self.err)).into_response()
        }
    }

    /// 400 with a message
    pub(crate) fn bad_request(msg: String) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            err: anyhow::anyhow!(msg),
        }
    }

    /// map store errors onto statuses: missing is 404, an existing
    /// binding is 409, anything else is on us
    pub(crate) fn store_err(err: lease_manager::Error) -> ApiError {
        let status = match &err {
            lease_manager::Error::NotFound => StatusCode::NOT_FOUND,
            lease_manager::Error::Conflict => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            err: err.into(),
        }
    }
}
