//! # ControlPlane: the operator HTTP endpoint.
//!
//! Optional listeners bound to a TCP address, a Unix socket path, or TLS
//! (via `certfile`), each serving the status and management URL
//! contract:
//!
//! - `GET /status/version`, `GET /status/tasks`, `GET /status/config`
//! - `GET|POST /manage/count`, `POST /manage/control`,
//!   `POST /manage/reload`, `POST /manage/reset`, `POST /manage/stop`
//!
//! `manage/*` routes exist only on listeners with `allow_control`; other
//! listeners return 404 for them. Handlers never touch supervisor state
//! directly: each request is forwarded into the event loop as a
//! [`ControlRequest`] stimulus and the reply comes back on a oneshot
//! channel, so all state stays owned by the single loop task. Stop and
//! reset are scheduled rather than immediate, letting the response flush
//! before the process goes away.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::poller::Stimulus;
use crate::task::TaskStatus;

/// Outcome of a management change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Changed,
    NoChange,
}

/// A request forwarded from a listener into the event loop.
pub enum ControlRequest {
    Status {
        reply: oneshot::Sender<BTreeMap<String, TaskStatus>>,
    },
    ConfigSnapshot {
        reply: oneshot::Sender<serde_json::Value>,
    },
    GetCount {
        task: String,
        reply: oneshot::Sender<Option<u32>>,
    },
    SetCount {
        task: String,
        count: u32,
        reply: oneshot::Sender<Result<ChangeOutcome, String>>,
    },
    SetControl {
        task: String,
        control: String,
        reply: oneshot::Sender<Result<ChangeOutcome, String>>,
    },
    Reload {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlRequest::Status { .. } => "Status",
            ControlRequest::ConfigSnapshot { .. } => "ConfigSnapshot",
            ControlRequest::GetCount { .. } => "GetCount",
            ControlRequest::SetCount { .. } => "SetCount",
            ControlRequest::SetControl { .. } => "SetControl",
            ControlRequest::Reload { .. } => "Reload",
            ControlRequest::Reset { .. } => "Reset",
            ControlRequest::Stop { .. } => "Stop",
        };
        f.write_str(name)
    }
}

/// One listener's resolved description; compared on reload to decide
/// whether the running server must be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpService {
    pub listen: String,
    pub certfile: Option<String>,
    pub allow_control: bool,
}

/// A running listener.
pub struct ListenerHandle {
    pub service: HttpService,
    cancel: CancellationToken,
}

impl ListenerHandle {
    /// Stops accepting; in-flight requests finish on their own tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
struct AppState {
    tx: mpsc::UnboundedSender<Stimulus>,
    allow_control: bool,
}

impl AppState {
    /// Sends a request into the loop and awaits the typed reply.
    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, StatusCode> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Stimulus::Control(make(reply)))
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
        rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Binds and serves one listener. `listen` forms: `host:port`, or an
/// absolute path for a Unix socket.
pub async fn spawn_listener(
    service: HttpService,
    tx: mpsc::UnboundedSender<Stimulus>,
) -> Result<ListenerHandle, String> {
    let state = AppState {
        tx,
        allow_control: service.allow_control,
    };
    let app = build_router(state);
    let cancel = CancellationToken::new();
    let child = cancel.clone();

    if service.listen.starts_with('/') {
        let _ = std::fs::remove_file(&service.listen);
        let listener =
            UnixListener::bind(&service.listen).map_err(|e| format!("bind {}: {e}", service.listen))?;
        info!(listen = %service.listen, "control listener on unix socket");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(child.cancelled_owned())
                .await;
        });
    } else {
        let listener = TcpListener::bind(&service.listen)
            .await
            .map_err(|e| format!("bind {}: {e}", service.listen))?;
        match &service.certfile {
            Some(certfile) => {
                let tls = tls_acceptor(Path::new(certfile))?;
                info!(listen = %service.listen, certfile, "control listener with TLS");
                tokio::spawn(serve_tls(listener, tls, app, child));
            }
            None => {
                info!(listen = %service.listen, "control listener");
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app)
                        .with_graceful_shutdown(child.cancelled_owned())
                        .await;
                });
            }
        }
    }
    Ok(ListenerHandle { service, cancel })
}

/// Builds the router; `manage/*` only when the listener allows control.
fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/status/version", get(version).post(version))
        .route("/status/tasks", get(tasks).post(tasks))
        .route("/status/config", get(config).post(config));
    if state.allow_control {
        router = router
            .route("/manage/count", get(get_count).post(set_count))
            .route("/manage/control", post(set_control))
            .route("/manage/reload", post(reload))
            .route("/manage/reset", post(reset))
            .route("/manage/stop", post(stop));
    }
    router.with_state(state)
}

/// Testing/embedding constructor for the router.
pub fn router_for(tx: mpsc::UnboundedSender<Stimulus>, allow_control: bool) -> Router {
    build_router(AppState { tx, allow_control })
}

/// Certificate chain and private key from one PEM file.
fn tls_acceptor(certfile: &Path) -> Result<TlsAcceptor, String> {
    let pem = std::fs::read(certfile).map_err(|e| format!("read {}: {e}", certfile.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad certificate in {}: {e}", certfile.display()))?;
    if certs.is_empty() {
        return Err(format!("no certificates in {}", certfile.display()));
    }
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| format!("bad key in {}: {e}", certfile.display()))?
        .ok_or_else(|| format!("no private key in {}", certfile.display()))?;
    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("tls config: {e}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tls accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = hyper_util::service::TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls);
            let _ = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await;
        });
    }
}

/// Query and form parameters merged, form entries winning.
fn merged(
    query: HashMap<String, String>,
    form: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut out = query;
    if let Some(form) = form {
        out.extend(form);
    }
    out
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "legiond": env!("CARGO_PKG_VERSION"),
        "platform": { "system": std::env::consts::OS },
    }))
}

async fn tasks(State(state): State<AppState>) -> Result<Json<BTreeMap<String, TaskStatus>>, StatusCode> {
    let map = state.ask(|reply| ControlRequest::Status { reply }).await?;
    Ok(Json(map))
}

async fn config(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let value = state
        .ask(|reply| ControlRequest::ConfigSnapshot { reply })
        .await?;
    Ok(Json(value))
}

async fn get_count(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(task) = query.get("task").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing 'task'\n").into_response();
    };
    match state
        .ask(|reply| ControlRequest::GetCount {
            task: task.clone(),
            reply,
        })
        .await
    {
        Ok(Some(count)) => {
            let mut body = serde_json::Map::new();
            body.insert(task, serde_json::Value::from(count));
            Json(serde_json::Value::Object(body)).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, format!("{task}\tnot found\n")).into_response(),
        Err(code) => code.into_response(),
    }
}

async fn set_count(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, axum::extract::rejection::FormRejection>,
) -> Response {
    let params = merged(query, form.ok().map(|Form(f)| f));
    let Some(task) = params.get("task").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing 'task'\n").into_response();
    };
    let Some(count) = params.get("count").and_then(|c| c.parse::<u32>().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing or bad 'count'\n").into_response();
    };
    if count < 1 {
        return (StatusCode::BAD_REQUEST, "count must be >= 1\n").into_response();
    }
    change_response(
        &task,
        state
            .ask(|reply| ControlRequest::SetCount {
                task: task.clone(),
                count,
                reply,
            })
            .await,
    )
}

async fn set_control(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, axum::extract::rejection::FormRejection>,
) -> Response {
    let params = merged(query, form.ok().map(|Form(f)| f));
    let Some(task) = params.get("task").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing 'task'\n").into_response();
    };
    let Some(control) = params.get("control").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing 'control'\n").into_response();
    };
    change_response(
        &task,
        state
            .ask(|reply| ControlRequest::SetControl {
                task: task.clone(),
                control: control.clone(),
                reply,
            })
            .await,
    )
}

fn change_response(task: &str, result: Result<Result<ChangeOutcome, String>, StatusCode>) -> Response {
    match result {
        Ok(Ok(ChangeOutcome::Changed)) => {
            (StatusCode::ACCEPTED, format!("{task}\tok\n")).into_response()
        }
        Ok(Ok(ChangeOutcome::NoChange)) => {
            (StatusCode::OK, format!("{task}\tno change\n")).into_response()
        }
        Ok(Err(reason)) => (StatusCode::NOT_FOUND, format!("{task}\t{reason}\n")).into_response(),
        Err(code) => code.into_response(),
    }
}

async fn reload(State(state): State<AppState>) -> Response {
    match state.ask(|reply| ControlRequest::Reload { reply }).await {
        Ok(()) => (StatusCode::ACCEPTED, "reload scheduled\n").into_response(),
        Err(code) => code.into_response(),
    }
}

async fn reset(State(state): State<AppState>) -> Response {
    match state.ask(|reply| ControlRequest::Reset { reply }).await {
        Ok(()) => (StatusCode::ACCEPTED, "reset scheduled\n").into_response(),
        Err(code) => code.into_response(),
    }
}

async fn stop(State(state): State<AppState>) -> Response {
    match state.ask(|reply| ControlRequest::Stop { reply }).await {
        Ok(()) => (StatusCode::ACCEPTED, "stop scheduled\n").into_response(),
        Err(code) => code.into_response(),
    }
}
