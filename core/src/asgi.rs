use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderName, HeaderValue, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use futures::{FutureExt, StreamExt};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList, PyTuple};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::app::{AppDefinition, AppServer, RequestContext};
use crate::consts::{BODY_CHUNK_SIZE, COMPLETION_CAPACITY, REQUEST_OP_CAPACITY};
use crate::errors::{AppLoadError, AppStartError, CleanupError, DispatchError, LifespanError};
use crate::interpreter::{run_py, runtime_module};
use crate::registry::ShardedRegistry;

pub(crate) static ASGI_REQUESTS: LazyLock<ShardedRegistry<AsgiHandle>> =
    LazyLock::new(ShardedRegistry::new);

/// WebSocket lifecycle of one ASGI request, stored as an atomic so the
/// receive/send/cancel paths can consult it without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WsState {
    None,
    Starting,
    Connected,
    Disconnected,
}

impl WsState {
    fn from_u8(value: u8) -> WsState {
        match value {
            1 => WsState::Starting,
            2 => WsState::Connected,
            3 => WsState::Disconnected,
            _ => WsState::None,
        }
    }
}

/// Registry entry for an in-flight ASGI request: the operation queue the
/// consumer task drains in FIFO order, the completion channel, and the
/// WebSocket state.
#[derive(Clone)]
pub(crate) struct AsgiHandle {
    inner: Arc<AsgiHandleInner>,
}

struct AsgiHandleInner {
    ops: mpsc::Sender<RequestOp>,
    done: mpsc::Sender<DoneSignal>,
    ws_state: AtomicU8,
}

impl AsgiHandle {
    fn new(ops: mpsc::Sender<RequestOp>, done: mpsc::Sender<DoneSignal>) -> Self {
        AsgiHandle {
            inner: Arc::new(AsgiHandleInner {
                ops,
                done,
                ws_state: AtomicU8::new(WsState::None as u8),
            }),
        }
    }

    pub(crate) fn ops_sender(&self) -> mpsc::Sender<RequestOp> {
        self.inner.ops.clone()
    }

    pub(crate) fn ws_state(&self) -> WsState {
        WsState::from_u8(self.inner.ws_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_ws_state(&self, state: WsState) {
        self.inner.ws_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn signal_done(&self, signal: DoneSignal) {
        let _ = self.inner.done.try_send(signal);
    }
}

/// Operations queued on a request's operation channel, drained in
/// application order by the consumer task.
pub(crate) enum RequestOp {
    ReceiveStart,
    Send(AsgiSendOp),
    Stop,
}

/// A parsed `await send(event)` payload.
pub(crate) enum AsgiSendOp {
    ResponseStart {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    ResponseBody {
        body: Vec<u8>,
        more_body: bool,
    },
    WsAccept {
        subprotocol: Option<String>,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    WsSendText(String),
    WsSendBinary(Vec<u8>),
    WsClose {
        code: u16,
        reason: Option<String>,
    },
}

impl AsgiSendOp {
    pub(crate) fn is_websocket(&self) -> bool {
        matches!(
            self,
            AsgiSendOp::WsAccept { .. }
                | AsgiSendOp::WsSendText(_)
                | AsgiSendOp::WsSendBinary(_)
                | AsgiSendOp::WsClose { .. }
        )
    }
}

/// Outcome reported by the application task's done-callback.
#[derive(Debug)]
pub(crate) enum DoneSignal {
    Finished,
    Cancelled(String),
    WebSocketClosed,
}

/// An asynchronous ASGI 3.0 application imported into the embedded
/// interpreter.
///
/// The application coroutine is scheduled onto the interpreter's asyncio
/// loop; `receive` and `send` suspend on per-request condition variables
/// that the consumer task wakes as it services the operation queue.
pub struct AsgiApp {
    definition: AppDefinition,
    callable: Arc<Py<PyAny>>,
    lifespan: Option<Arc<Py<PyAny>>>,
}

impl AsgiApp {
    pub(crate) async fn load(definition: AppDefinition) -> Result<Self, AppStartError> {
        let module = definition.module.clone();
        let symbol = definition.symbol.clone();
        let working_dir = definition
            .working_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().to_string());
        let site_packages = definition
            .site_packages
            .as_ref()
            .map(|dir| dir.to_string_lossy().to_string());

        let callable = run_py(move |py| {
            let runtime = runtime_module(py);
            let loaded = runtime.call_method1(
                "load_app",
                (module.as_str(), symbol.as_str(), working_dir, site_packages),
            );
            match loaded {
                Ok(app) => {
                    if !app.is_callable() {
                        return Err(AppLoadError::NotCallable(format!("{module}:{symbol}")));
                    }
                    Ok(app.unbind())
                }
                Err(err) => {
                    let message = err.to_string();
                    err.print(py);
                    Err(AppLoadError::Python(message))
                }
            }
        })
        .await
        .map_err(AppStartError::Load)?;
        let callable = Arc::new(callable);

        let lifespan = if definition.lifespan {
            let app = callable.clone();
            let driver = run_py(move |py| {
                let runtime = runtime_module(py);
                let driver = runtime
                    .call_method1("build_lifespan", (app.bind(py),))
                    .map_err(|err| LifespanError::StartupException(err.to_string()))?;
                let startup_ok: bool = runtime
                    .call_method1("lifespan_startup", (&driver,))
                    .and_then(|value| value.extract())
                    .map_err(|err| {
                        let message = err.to_string();
                        err.print(py);
                        LifespanError::StartupException(message)
                    })?;
                if !startup_ok {
                    return Err(LifespanError::StartupFailed);
                }
                Ok(driver.unbind())
            })
            .await
            .map_err(AppStartError::Lifespan)?;
            Some(Arc::new(driver))
        } else {
            None
        };

        debug!(
            module = %definition.module,
            symbol = %definition.symbol,
            lifespan = definition.lifespan,
            "asgi application imported"
        );
        Ok(AsgiApp {
            definition,
            callable,
            lifespan,
        })
    }

    async fn handle_http(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        let (parts, body) = request.into_parts();
        let scope = ScopeData::from_request(&parts, &context, ScopeType::Http);

        let (ops_tx, ops_rx) = mpsc::channel(REQUEST_OP_CAPACITY);
        let (done_tx, mut done_rx) = mpsc::channel(COMPLETION_CAPACITY);
        let handle = AsgiHandle::new(ops_tx, done_tx);
        let request_id = ASGI_REQUESTS.register(handle.clone());

        let event = match schedule_app(
            request_id,
            self.callable.clone(),
            self.lifespan.clone(),
            scope,
        )
        .await
        {
            Ok(event) => Arc::new(event),
            Err(err) => {
                ASGI_REQUESTS.unregister(request_id);
                return Err(err);
            }
        };

        let (head_tx, mut head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(REQUEST_OP_CAPACITY);

        let consumer = RequestConsumer {
            handle: handle.clone(),
            event,
            source: ReceiveSource::Http(HttpBodySource::new(body)),
            sink: SendSink::Http(HttpSink {
                head: Some(head_tx),
                body: Some(body_tx),
            }),
        };
        tokio::spawn(consumer.run(ops_rx));

        // Wait for the response head. A completion signal may arrive first
        // (the application finished or failed before any response event was
        // serviced); queued operations are still drained in order, so the
        // head can legitimately show up after the stop sentinel is queued.
        let mut done_seen = false;
        let head = loop {
            tokio::select! { biased;
                head = &mut head_rx => break head.ok(),
                signal = done_rx.recv(), if !done_seen => {
                    match signal {
                        Some(DoneSignal::Cancelled(reason)) => {
                            let _ = handle.ops_sender().send(RequestOp::Stop).await;
                            ASGI_REQUESTS.unregister(request_id);
                            return Err(DispatchError::Cancelled(reason));
                        }
                        Some(DoneSignal::Finished) | Some(DoneSignal::WebSocketClosed) | None => {
                            done_seen = true;
                            let _ = handle.ops_sender().send(RequestOp::Stop).await;
                        }
                    }
                }
            }
        };

        let Some((status, headers)) = head else {
            // The consumer stopped without a response start event.
            ASGI_REQUESTS.unregister(request_id);
            return Err(DispatchError::ChannelClosed);
        };

        if done_seen {
            ASGI_REQUESTS.unregister(request_id);
        } else {
            let finish_handle = handle.clone();
            tokio::spawn(async move {
                let _ = done_rx.recv().await;
                let _ = finish_handle.ops_sender().send(RequestOp::Stop).await;
                ASGI_REQUESTS.unregister(request_id);
            });
        }

        let status =
            StatusCode::from_u16(status).map_err(|err| DispatchError::Protocol(err.to_string()))?;
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(&name)
                .map_err(|err| DispatchError::Protocol(err.to_string()))?;
            let value = HeaderValue::from_bytes(&value)
                .map_err(|err| DispatchError::Protocol(err.to_string()))?;
            builder = builder.header(name, value);
        }
        let stream = futures::stream::unfold(body_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        builder
            .body(Body::from_stream(stream))
            .map_err(|err| DispatchError::Protocol(err.to_string()))
    }

    async fn handle_websocket(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        let (mut parts, _body) = request.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return Ok(rejection.into_response()),
        };
        let scope = ScopeData::from_request(&parts, &context, ScopeType::WebSocket);

        let (ops_tx, ops_rx) = mpsc::channel(REQUEST_OP_CAPACITY);
        let (done_tx, mut done_rx) = mpsc::channel(COMPLETION_CAPACITY);
        let handle = AsgiHandle::new(ops_tx, done_tx);
        handle.set_ws_state(WsState::Starting);
        let request_id = ASGI_REQUESTS.register(handle.clone());

        let event = match schedule_app(
            request_id,
            self.callable.clone(),
            self.lifespan.clone(),
            scope,
        )
        .await
        {
            Ok(event) => Arc::new(event),
            Err(err) => {
                ASGI_REQUESTS.unregister(request_id);
                return Err(err);
            }
        };

        let (decision_tx, mut decision_rx) = oneshot::channel();
        let (ws_in_tx, ws_in_rx) = mpsc::channel(REQUEST_OP_CAPACITY);
        let (ws_out_tx, ws_out_rx) = mpsc::channel::<Message>(REQUEST_OP_CAPACITY);

        let consumer = RequestConsumer {
            handle: handle.clone(),
            event,
            source: ReceiveSource::Ws(WsSource::new(ws_in_rx)),
            sink: SendSink::Ws(WsSink {
                handle: handle.clone(),
                decision: Some(decision_tx),
                outgoing: ws_out_tx,
            }),
        };
        tokio::spawn(consumer.run(ops_rx));

        let decision = loop {
            tokio::select! { biased;
                decision = &mut decision_rx => break decision.ok(),
                signal = done_rx.recv() => {
                    // The application ended before accepting or rejecting.
                    handle.set_ws_state(WsState::Disconnected);
                    let _ = handle.ops_sender().send(RequestOp::Stop).await;
                    ASGI_REQUESTS.unregister(request_id);
                    return match signal {
                        Some(DoneSignal::Cancelled(reason)) => {
                            Err(DispatchError::Cancelled(reason))
                        }
                        _ => Err(DispatchError::UpgradeRejected),
                    };
                }
            }
        };

        match decision {
            Some(UpgradeDecision::Accept {
                subprotocol,
                headers,
            }) => {
                let drive_handle = handle.clone();
                let mut response = upgrade
                    .on_upgrade(move |socket| {
                        drive_socket(
                            socket,
                            request_id,
                            drive_handle,
                            ws_in_tx,
                            ws_out_rx,
                            done_rx,
                        )
                    })
                    .into_response();
                if let Some(subprotocol) = subprotocol {
                    if let Ok(value) = HeaderValue::from_str(&subprotocol) {
                        response
                            .headers_mut()
                            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                    }
                }
                for (name, value) in headers {
                    let Ok(name) = HeaderName::from_bytes(&name) else {
                        continue;
                    };
                    let Ok(value) = HeaderValue::from_bytes(&value) else {
                        continue;
                    };
                    response.headers_mut().append(name, value);
                }
                Ok(response)
            }
            Some(UpgradeDecision::Reject) | None => {
                handle.set_ws_state(WsState::Disconnected);
                let _ = handle.ops_sender().send(RequestOp::Stop).await;
                // Let the application task settle before dropping the entry.
                let _ = done_rx.recv().await;
                ASGI_REQUESTS.unregister(request_id);
                Err(DispatchError::UpgradeRejected)
            }
        }
    }

    async fn shutdown_lifespan(&self) -> Result<(), CleanupError> {
        let Some(driver) = self.lifespan.clone() else {
            return Ok(());
        };
        let shutdown = run_py(move |py| {
            let runtime = runtime_module(py);
            match runtime
                .call_method1("lifespan_shutdown", (driver.bind(py),))
                .and_then(|value| value.extract::<bool>())
            {
                Ok(ok) => Ok(ok),
                Err(err) => {
                    let message = err.to_string();
                    err.print(py);
                    Err(LifespanError::ShutdownException(message))
                }
            }
        })
        .await;
        match shutdown {
            Ok(true) => Ok(()),
            Ok(false) => Err(CleanupError::Lifespan(LifespanError::ShutdownFailed)),
            Err(err) => Err(CleanupError::Lifespan(err)),
        }
    }
}

#[async_trait]
impl AppServer for AsgiApp {
    async fn handle_request(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        if is_websocket_upgrade(&request) {
            self.handle_websocket(request, context).await
        } else {
            self.handle_http(request, context).await
        }
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        let result = self.shutdown_lifespan().await;
        debug!(
            module = %self.definition.module,
            symbol = %self.definition.symbol,
            "asgi application released"
        );
        result
    }
}

fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

enum UpgradeDecision {
    Accept {
        subprotocol: Option<String>,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Reject,
}

#[derive(Clone, Copy, PartialEq)]
enum ScopeType {
    Http,
    WebSocket,
}

/// Everything needed to build the Python scope mapping, gathered on the
/// server side so the interpreter submission owns plain data.
struct ScopeData {
    kind: ScopeType,
    http_version: &'static str,
    method: String,
    scheme: &'static str,
    path: String,
    raw_path: Vec<u8>,
    query_string: Vec<u8>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    client: (String, u16),
    server: (String, u16),
    subprotocols: Vec<String>,
}

impl ScopeData {
    fn from_request(parts: &Parts, context: &RequestContext, kind: ScopeType) -> ScopeData {
        let raw_path = parts.uri.path().as_bytes().to_vec();
        let path = urlencoding::decode(parts.uri.path())
            .map(|decoded| decoded.to_string())
            .unwrap_or_else(|_| parts.uri.path().to_string());

        let scheme = match (kind, context.tls) {
            (ScopeType::Http, false) => "http",
            (ScopeType::Http, true) => "https",
            (ScopeType::WebSocket, false) => "ws",
            (ScopeType::WebSocket, true) => "wss",
        };

        let mut headers: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        let mut cookies: Vec<Vec<u8>> = vec![];
        for (name, value) in parts.headers.iter() {
            // `Proxy` never reaches applications (CGI header smuggling).
            if name.as_str().eq_ignore_ascii_case("proxy") {
                continue;
            }
            if name == header::COOKIE {
                cookies.push(value.as_bytes().to_vec());
                continue;
            }
            headers.push((
                name.as_str().to_ascii_lowercase().into_bytes(),
                value.as_bytes().to_vec(),
            ));
        }
        if !cookies.is_empty() {
            headers.push((b"cookie".to_vec(), cookies.join(&b"; "[..])));
        }

        let subprotocols = parts
            .headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(',')
                    .map(|protocol| protocol.trim().to_string())
                    .filter(|protocol| !protocol.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        ScopeData {
            kind,
            http_version: http_version_string(parts.version),
            method: parts.method.as_str().to_string(),
            scheme,
            path,
            raw_path,
            query_string: parts
                .uri
                .query()
                .map(|query| query.as_bytes().to_vec())
                .unwrap_or_default(),
            headers,
            client: (
                context.client_addr.ip().to_string(),
                context.client_addr.port(),
            ),
            server: (
                context.server_addr.ip().to_string(),
                context.server_addr.port(),
            ),
            subprotocols,
        }
    }
}

fn http_version_string(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 | Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// Builds the scope, creates the per-request event and schedules the
/// application coroutine onto the interpreter's event loop.
async fn schedule_app(
    request_id: u64,
    callable: Arc<Py<PyAny>>,
    lifespan: Option<Arc<Py<PyAny>>>,
    scope: ScopeData,
) -> Result<Py<PyAny>, DispatchError> {
    run_py(move |py| {
        let result: PyResult<Py<PyAny>> = (|| {
            let runtime = runtime_module(py);
            let scope_dict = build_scope(py, &scope, lifespan.as_deref())?;
            let event = runtime
                .getattr("AsgiEvent")?
                .call1((request_id,))?;
            if scope.kind == ScopeType::WebSocket {
                event.setattr("websocket_state", WsState::Starting as u8)?;
            }
            runtime.call_method1(
                "handle_asgi",
                (request_id, callable.bind(py), scope_dict, &event),
            )?;
            Ok(event.unbind())
        })();
        result.map_err(|err| {
            let message = err.to_string();
            err.print(py);
            DispatchError::Python(message)
        })
    })
    .await
}

fn build_scope<'py>(
    py: Python<'py>,
    scope: &ScopeData,
    lifespan: Option<&Py<PyAny>>,
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    let asgi = PyDict::new(py);
    asgi.set_item("version", "3.0")?;
    asgi.set_item("spec_version", "2.3")?;
    dict.set_item("asgi", asgi)?;

    match scope.kind {
        ScopeType::Http => {
            dict.set_item("type", "http")?;
            dict.set_item("method", scope.method.as_str())?;
        }
        ScopeType::WebSocket => {
            dict.set_item("type", "websocket")?;
            let subprotocols = PyList::new(py, scope.subprotocols.iter())?;
            dict.set_item("subprotocols", subprotocols)?;
        }
    }
    dict.set_item("http_version", scope.http_version)?;
    dict.set_item("scheme", scope.scheme)?;
    dict.set_item("path", scope.path.as_str())?;
    dict.set_item("raw_path", PyBytes::new(py, &scope.raw_path))?;
    dict.set_item("query_string", PyBytes::new(py, &scope.query_string))?;
    dict.set_item("root_path", "")?;

    let headers = PyList::empty(py);
    for (name, value) in &scope.headers {
        headers.append(PyTuple::new(
            py,
            [PyBytes::new(py, name), PyBytes::new(py, value)],
        )?)?;
    }
    dict.set_item("headers", headers)?;
    dict.set_item("client", (scope.client.0.as_str(), scope.client.1))?;
    dict.set_item("server", (scope.server.0.as_str(), scope.server.1))?;

    if let Some(driver) = lifespan {
        // Each request sees a defensive copy of the lifespan state mapping.
        let state = runtime_module(py).call_method1("state_copy", (driver.bind(py),))?;
        dict.set_item("state", state)?;
    }
    Ok(dict)
}

/// Events staged for `await receive()`.
enum ReceivePayload {
    HttpBody { body: Bytes, more: bool },
    HttpDisconnect,
    WsConnect,
    WsText(String),
    WsBinary(Bytes),
    WsDisconnect(u16),
}

enum ReceiveSource {
    Http(HttpBodySource),
    Ws(WsSource),
}

/// Streams the inbound request body in bounded chunks.
struct HttpBodySource {
    stream: axum::body::BodyDataStream,
    buffered: Bytes,
    body_done: bool,
    disconnected: bool,
}

impl HttpBodySource {
    fn new(body: Body) -> Self {
        HttpBodySource {
            stream: body.into_data_stream(),
            buffered: Bytes::new(),
            body_done: false,
            disconnected: false,
        }
    }

    async fn next(&mut self) -> ReceivePayload {
        if self.disconnected {
            return ReceivePayload::HttpDisconnect;
        }
        if self.body_done {
            // The full body was already delivered; the only event left for
            // this request is the disconnect.
            self.disconnected = true;
            return ReceivePayload::HttpDisconnect;
        }
        if self.buffered.is_empty() {
            match self.stream.next().await {
                Some(Ok(frame)) => self.buffered = frame,
                Some(Err(_)) => {
                    self.disconnected = true;
                    return ReceivePayload::HttpDisconnect;
                }
                None => {
                    self.body_done = true;
                    return ReceivePayload::HttpBody {
                        body: Bytes::new(),
                        more: false,
                    };
                }
            }
        }
        let take = self.buffered.len().min(BODY_CHUNK_SIZE);
        let chunk = self.buffered.split_to(take);
        if self.buffered.is_empty() {
            // Peek for end-of-body so the final chunk carries the terminal
            // flag whenever it is already knowable.
            match self.stream.next().now_or_never() {
                Some(Some(Ok(frame))) => self.buffered = frame,
                Some(Some(Err(_))) | Some(None) => self.body_done = true,
                None => {}
            }
        }
        ReceivePayload::HttpBody {
            more: !self.body_done,
            body: chunk,
        }
    }
}

/// Frames forwarded from the live WebSocket connection.
enum WsIncoming {
    Text(String),
    Binary(Bytes),
    Disconnect(u16),
}

struct WsSource {
    incoming: mpsc::Receiver<WsIncoming>,
    connect_delivered: bool,
    disconnect_delivered: bool,
    // Disconnect injected locally when the application itself closed the
    // connection, so a subsequent receive resolves without remote traffic.
    pending_disconnect: Option<u16>,
}

impl WsSource {
    fn new(incoming: mpsc::Receiver<WsIncoming>) -> Self {
        WsSource {
            incoming,
            connect_delivered: false,
            disconnect_delivered: false,
            pending_disconnect: None,
        }
    }

    async fn next(&mut self) -> ReceivePayload {
        if !self.connect_delivered {
            self.connect_delivered = true;
            return ReceivePayload::WsConnect;
        }
        if self.disconnect_delivered {
            // The disconnect event is delivered exactly once; anything
            // after it stays suspended until the request is torn down.
            std::future::pending::<()>().await;
            unreachable!()
        }
        if let Some(code) = self.pending_disconnect.take() {
            self.disconnect_delivered = true;
            return ReceivePayload::WsDisconnect(code);
        }
        match self.incoming.recv().await {
            Some(WsIncoming::Text(text)) => ReceivePayload::WsText(text),
            Some(WsIncoming::Binary(bytes)) => ReceivePayload::WsBinary(bytes),
            Some(WsIncoming::Disconnect(code)) => {
                self.disconnect_delivered = true;
                ReceivePayload::WsDisconnect(code)
            }
            None => {
                self.disconnect_delivered = true;
                ReceivePayload::WsDisconnect(1005)
            }
        }
    }
}

enum SendSink {
    Http(HttpSink),
    Ws(WsSink),
}

struct HttpSink {
    head: Option<oneshot::Sender<(u16, Vec<(Vec<u8>, Vec<u8>)>)>>,
    body: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
}

struct WsSink {
    handle: AsgiHandle,
    decision: Option<oneshot::Sender<UpgradeDecision>>,
    outgoing: mpsc::Sender<Message>,
}

/// Drains one request's operation queue in FIFO order: staging receive
/// payloads, writing response output, and waking the matching condition
/// variable after each operation. Runs until the stop sentinel arrives,
/// then releases the Python event handle.
struct RequestConsumer {
    handle: AsgiHandle,
    event: Arc<Py<PyAny>>,
    source: ReceiveSource,
    sink: SendSink,
}

impl RequestConsumer {
    async fn run(mut self, mut ops: mpsc::Receiver<RequestOp>) {
        while let Some(op) = ops.recv().await {
            match op {
                RequestOp::ReceiveStart => {
                    let payload = match &mut self.source {
                        ReceiveSource::Http(source) => source.next().await,
                        ReceiveSource::Ws(source) => source.next().await,
                    };
                    if let ReceivePayload::WsDisconnect(_) = payload {
                        self.handle.set_ws_state(WsState::Disconnected);
                    }
                    let event = self.event.clone();
                    run_py(move |py| {
                        if let Err(err) = stage_receive(py, &event, payload) {
                            err.print(py);
                        }
                    })
                    .await;
                }
                RequestOp::Send(op) => {
                    let closed = self.process_send(op).await;
                    let event = self.event.clone();
                    run_py(move |py| {
                        let runtime = runtime_module(py);
                        let wake = if closed {
                            runtime.call_method1("wake_send_closed", (event.bind(py),))
                        } else {
                            runtime.call_method1("wake_send", (event.bind(py),))
                        };
                        if let Err(err) = wake {
                            err.print(py);
                        }
                    })
                    .await;
                }
                RequestOp::Stop => break,
            }
        }
        let event = self.event;
        run_py(move |py| {
            // Release the interpreter's event handle while holding the
            // interpreter lock.
            let _ = event.bind(py);
            drop(event);
        })
        .await;
    }

    /// Applies one send operation to the response sink. Returns true when
    /// the operation found the connection closed and the sender must be
    /// woken with the closed flag instead.
    async fn process_send(&mut self, op: AsgiSendOp) -> bool {
        match (&mut self.sink, op) {
            (SendSink::Http(sink), AsgiSendOp::ResponseStart { status, headers }) => {
                if let Some(head) = sink.head.take() {
                    let _ = head.send((status, headers));
                } else {
                    warn!("duplicate http.response.start event, ignoring");
                }
                false
            }
            (SendSink::Http(sink), AsgiSendOp::ResponseBody { body, more_body }) => {
                if let Some(sender) = &sink.body {
                    let _ = sender.send(Ok(Bytes::from(body))).await;
                    if !more_body {
                        sink.body = None;
                        self.handle.signal_done(DoneSignal::Finished);
                    }
                }
                false
            }
            (SendSink::Http(_), op) if op.is_websocket() => {
                warn!("websocket event on http scope, cancelling request");
                self.handle
                    .signal_done(DoneSignal::Cancelled("websocket event on http scope".into()));
                false
            }
            (
                SendSink::Ws(sink),
                AsgiSendOp::WsAccept {
                    subprotocol,
                    headers,
                },
            ) => {
                if let Some(decision) = sink.decision.take() {
                    let _ = decision.send(UpgradeDecision::Accept {
                        subprotocol,
                        headers,
                    });
                }
                false
            }
            (SendSink::Ws(sink), AsgiSendOp::WsSendText(text)) => {
                if sink.handle.ws_state() == WsState::Disconnected {
                    return true;
                }
                sink.outgoing.send(Message::Text(text.into())).await.is_err()
            }
            (SendSink::Ws(sink), AsgiSendOp::WsSendBinary(bytes)) => {
                if sink.handle.ws_state() == WsState::Disconnected {
                    return true;
                }
                sink.outgoing
                    .send(Message::Binary(bytes.into()))
                    .await
                    .is_err()
            }
            (SendSink::Ws(sink), AsgiSendOp::WsClose { code, reason }) => {
                if let Some(decision) = sink.decision.take() {
                    // Closed before accepting: the upgrade is rejected.
                    let _ = decision.send(UpgradeDecision::Reject);
                    sink.handle.set_ws_state(WsState::Disconnected);
                    if let ReceiveSource::Ws(source) = &mut self.source {
                        source.pending_disconnect = Some(code);
                    }
                    return false;
                }
                if sink.handle.ws_state() == WsState::Disconnected {
                    return true;
                }
                let frame = CloseFrame {
                    code,
                    reason: reason.unwrap_or_default().into(),
                };
                let _ = sink.outgoing.send(Message::Close(Some(frame))).await;
                sink.handle.set_ws_state(WsState::Disconnected);
                if let ReceiveSource::Ws(source) = &mut self.source {
                    source.pending_disconnect = Some(code);
                }
                false
            }
            (SendSink::Ws(sink), AsgiSendOp::ResponseStart { .. })
            | (SendSink::Ws(sink), AsgiSendOp::ResponseBody { .. }) => {
                if let Some(decision) = sink.decision.take() {
                    let _ = decision.send(UpgradeDecision::Reject);
                    sink.handle.set_ws_state(WsState::Disconnected);
                    if let ReceiveSource::Ws(source) = &mut self.source {
                        source.pending_disconnect = Some(1006);
                    }
                }
                false
            }
            (SendSink::Http(_), _) => false,
        }
    }
}

fn stage_receive(py: Python<'_>, event: &Py<PyAny>, payload: ReceivePayload) -> PyResult<()> {
    let dict = PyDict::new(py);
    match payload {
        ReceivePayload::HttpBody { body, more } => {
            dict.set_item("type", "http.request")?;
            dict.set_item("body", PyBytes::new(py, &body))?;
            dict.set_item("more_body", more)?;
        }
        ReceivePayload::HttpDisconnect => {
            dict.set_item("type", "http.disconnect")?;
        }
        ReceivePayload::WsConnect => {
            dict.set_item("type", "websocket.connect")?;
        }
        ReceivePayload::WsText(text) => {
            dict.set_item("type", "websocket.receive")?;
            dict.set_item("text", text)?;
        }
        ReceivePayload::WsBinary(bytes) => {
            dict.set_item("type", "websocket.receive")?;
            dict.set_item("bytes", PyBytes::new(py, &bytes))?;
        }
        ReceivePayload::WsDisconnect(code) => {
            dict.set_item("type", "websocket.disconnect")?;
            dict.set_item("code", code)?;
        }
    }
    runtime_module(py).call_method1("wake_receive", (event.bind(py), dict))?;
    Ok(())
}

/// Pumps the upgraded socket: inbound frames flow to the receive bridge,
/// outbound operations flow from the consumer, and the completion signal
/// initiates the close handshake.
async fn drive_socket(
    mut socket: WebSocket,
    request_id: u64,
    handle: AsgiHandle,
    ws_in_tx: mpsc::Sender<WsIncoming>,
    mut ws_out_rx: mpsc::Receiver<Message>,
    mut done_rx: mpsc::Receiver<DoneSignal>,
) {
    handle.set_ws_state(WsState::Connected);
    debug!(request_id, "websocket connection established");

    let mut done: Option<DoneSignal> = None;
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if ws_in_tx.try_send(WsIncoming::Text(text.to_string())).is_err() {
                        debug!(request_id, "inbound frame queue full, dropping text frame");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if ws_in_tx.try_send(WsIncoming::Binary(bytes)).is_err() {
                        debug!(request_id, "inbound frame queue full, dropping binary frame");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| frame.code).unwrap_or(1005);
                    handle.set_ws_state(WsState::Disconnected);
                    let _ = ws_in_tx.try_send(WsIncoming::Disconnect(code));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    handle.set_ws_state(WsState::Disconnected);
                    let _ = ws_in_tx.try_send(WsIncoming::Disconnect(1005));
                    break;
                }
            },
            outbound = ws_out_rx.recv() => match outbound {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if socket.send(message).await.is_err() {
                        handle.set_ws_state(WsState::Disconnected);
                        let _ = ws_in_tx.try_send(WsIncoming::Disconnect(1005));
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => break,
            },
            signal = done_rx.recv(), if done.is_none() => {
                match signal {
                    Some(DoneSignal::Cancelled(reason)) => {
                        // Application errors that are not the closed
                        // sentinel close the connection with code 1000.
                        debug!(request_id, reason = %reason, "websocket application failed");
                        let frame = CloseFrame { code: 1000, reason: "".into() };
                        let _ = socket.send(Message::Close(Some(frame))).await;
                        done = Some(DoneSignal::Cancelled(reason));
                        break;
                    }
                    Some(other) => {
                        if handle.ws_state() != WsState::Disconnected {
                            let frame = CloseFrame { code: 1000, reason: "".into() };
                            let _ = socket.send(Message::Close(Some(frame))).await;
                        }
                        done = Some(other);
                        break;
                    }
                    None => break,
                }
            },
        }
    }

    handle.set_ws_state(WsState::Disconnected);
    // Stop consuming outbound frames so pending sends fail over to the
    // closed path and the application observes the disconnect.
    drop(ws_out_rx);
    if done.is_none() {
        let _ = done_rx.recv().await;
    }
    let _ = handle.ops_sender().send(RequestOp::Stop).await;
    ASGI_REQUESTS.unregister(request_id);
    debug!(request_id, "websocket connection finished");
}
