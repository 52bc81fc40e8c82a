//! Gateway entry point.
//!
//! A single fallback route receives every Engine API call. Depending on the
//! configured backend the request is either classified and relayed to the real
//! daemon, or translated into an external runtime invocation.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use berth_config::{BackendKind, GatewayConfig};
use bytes::Bytes;

use crate::classify::{self, TransportMode};
use crate::error::{GatewayError, Result};
use crate::executor::{Executor, ProcessExecutor};
use crate::request::IncomingRequest;
use crate::translate::RuntimeTranslator;
use crate::transport::{DaemonDialer, DaemonProxy};

/// Upper bound on request bodies the gateway reads into memory.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Runs translated requests against the external runtime.
#[derive(Clone)]
pub struct RuntimeAdaptor {
    translator: RuntimeTranslator,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for RuntimeAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeAdaptor")
            .field("program", &self.translator.program())
            .finish_non_exhaustive()
    }
}

impl RuntimeAdaptor {
    pub fn new(translator: RuntimeTranslator, executor: Arc<dyn Executor>) -> Self {
        Self {
            translator,
            executor,
        }
    }

    /// Translate and run one request. Untranslatable requests succeed without
    /// running anything.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response> {
        let (parts, body) = req.into_parts();
        let body = read_body(body).await?;
        let incoming = IncomingRequest::new(parts.method, &parts.uri, parts.headers, body);

        match self.translator.translate(&incoming)? {
            Some(spec) => {
                let outcome = self.executor.execute(spec).await?;
                tracing::debug!(
                    code = outcome.code,
                    stdout_bytes = outcome.stdout_bytes,
                    stderr_bytes = outcome.stderr_bytes,
                    "runtime command completed"
                );
            }
            None => tracing::debug!(path = incoming.path(), "nothing to run"),
        }

        Ok(StatusCode::OK.into_response())
    }
}

/// Which backend serves requests. Fixed for the process lifetime.
#[derive(Debug, Clone)]
pub enum Backend {
    RealDaemon(DaemonProxy),
    ExternalRuntime(RuntimeAdaptor),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::RealDaemon(_) => BackendKind::RealDaemon,
            Backend::ExternalRuntime(_) => BackendKind::ExternalRuntime,
        }
    }
}

/// Shared, read-only state for every request handler.
#[derive(Debug)]
pub struct GatewayState {
    config: Arc<GatewayConfig>,
    backend: Backend,
}

impl GatewayState {
    pub fn new(config: Arc<GatewayConfig>, backend: Backend) -> Self {
        Self { config, backend }
    }

    /// Build the backend the configuration selects, running runtime commands
    /// as child processes.
    pub fn from_config(config: Arc<GatewayConfig>) -> Self {
        let backend = match config.backend.kind {
            BackendKind::RealDaemon => Backend::RealDaemon(DaemonProxy::new(DaemonDialer::new(
                config.backend.daemon_socket.clone(),
            ))),
            BackendKind::ExternalRuntime => Backend::ExternalRuntime(RuntimeAdaptor::new(
                RuntimeTranslator::new(config.runtime.clone()),
                Arc::new(ProcessExecutor::new()),
            )),
        };
        Self::new(config, backend)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> axum::Router {
    axum::Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<GatewayState>>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (mode, result) = match &state.backend {
        Backend::RealDaemon(proxy) => relay(proxy, req).await,
        Backend::ExternalRuntime(adaptor) => (None, adaptor.handle(req).await),
    };
    let resp = result.unwrap_or_else(IntoResponse::into_response);

    tracing::info!(
        %method,
        path,
        mode = mode.map(|m| m.to_string()).unwrap_or_else(|| "runtime".to_string()),
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    resp
}

async fn relay(proxy: &DaemonProxy, req: Request<Body>) -> (Option<TransportMode>, Result<Response>) {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    let (req, body) = if classify::needs_body(&path) {
        let (parts, body) = req.into_parts();
        let bytes = match read_body(body).await {
            Ok(bytes) => bytes,
            Err(e) => return (None, Err(e)),
        };
        (Request::from_parts(parts, Body::from(bytes.clone())), bytes)
    } else {
        (req, Bytes::new())
    };

    let mode = match classify::classify(&path, &query, &body) {
        Ok(mode) => mode,
        Err(e) => return (None, Err(e.into())),
    };
    tracing::debug!(path, %mode, "request classified");

    (Some(mode), proxy.forward(mode, req).await)
}

async fn read_body(body: Body) -> Result<Bytes> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::Body(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CaptureBuffer, OutputSink};
    use berth_config::RuntimeConfig;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn runtime_state(program: &str) -> (Arc<GatewayState>, CaptureBuffer) {
        let mut config = GatewayConfig::default();
        config.backend.kind = BackendKind::ExternalRuntime;
        config.runtime = RuntimeConfig {
            program: program.to_string(),
            ..RuntimeConfig::default()
        };

        let out = CaptureBuffer::new();
        let executor = ProcessExecutor::with_sinks(
            OutputSink::Capture(out.clone()),
            OutputSink::Capture(CaptureBuffer::new()),
        );
        let adaptor = RuntimeAdaptor::new(
            RuntimeTranslator::new(config.runtime.clone()),
            Arc::new(executor),
        );
        let state = GatewayState::new(Arc::new(config), Backend::ExternalRuntime(adaptor));
        (Arc::new(state), out)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_runtime_version_relays_output() {
        let (state, out) = runtime_state("echo");
        let req = Request::get("/v1.43/version").body(Body::empty()).unwrap();

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(out.to_string_lossy(), "version\n");
    }

    #[tokio::test]
    async fn test_runtime_unmatched_is_ok_noop() {
        let (state, out) = runtime_state("echo");
        let req = Request::get("/_ping").body(Body::empty()).unwrap();

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(out.contents().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_create_without_image_is_400() {
        let (state, _out) = runtime_state("echo");
        let req = Request::post("/containers/create")
            .body(Body::from(r#"{"Cmd":["sh"]}"#))
            .unwrap();

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["message"], "bad parameter: missing image");
    }

    #[tokio::test]
    async fn test_runtime_failure_is_500() {
        let (state, _out) = runtime_state("false");
        let req = Request::get("/containers/json").body(Body::empty()).unwrap();

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["message"], "false exited with status 1");
    }

    #[tokio::test]
    async fn test_runtime_missing_program_is_500() {
        let (state, _out) = runtime_state("/nonexistent/rkt");
        let req = Request::get("/version").body(Body::empty()).unwrap();

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_daemon_exec_start_without_detach_is_400() {
        let mut config = GatewayConfig::default();
        config.backend.daemon_socket = "/nonexistent/daemon.sock".into();
        let state = Arc::new(GatewayState::from_config(Arc::new(config)));

        let req = Request::post("/v1.43/exec/abc/start")
            .body(Body::from(r#"{"Tty":false}"#))
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["message"],
            "missing detach flag in request body"
        );
    }

    #[tokio::test]
    async fn test_daemon_unreachable_is_500() {
        let mut config = GatewayConfig::default();
        config.backend.daemon_socket = "/nonexistent/daemon.sock".into();
        let state = Arc::new(GatewayState::from_config(Arc::new(config)));

        let req = Request::get("/containers/json").body(Body::empty()).unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_from_config_selects_backend() {
        let mut config = GatewayConfig::default();
        let state = GatewayState::from_config(Arc::new(config.clone()));
        assert_eq!(state.backend().kind(), BackendKind::RealDaemon);

        config.backend.kind = BackendKind::ExternalRuntime;
        let state = GatewayState::from_config(Arc::new(config));
        assert_eq!(state.backend().kind(), BackendKind::ExternalRuntime);
    }
}
