use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;

use sidewinder_core::app::RequestContext;
use sidewinder_core::handler::{PythonApp, PythonAppConfig, WorkersRuntime};

mod common;

use common::{request_context, write_fixture};

async fn provision_wsgi(working_dir: &Path, module: &str) -> PythonApp {
    let config = PythonAppConfig {
        module_wsgi: Some(format!("{module}:app")),
        working_dir: Some(working_dir.to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        ..Default::default()
    };
    PythonApp::provision(config).await.expect("wsgi app should provision")
}

async fn provision_asgi(working_dir: &Path, module: &str) -> PythonApp {
    let config = PythonAppConfig {
        module_asgi: Some(format!("{module}:app")),
        working_dir: Some(working_dir.to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        ..Default::default()
    };
    PythonApp::provision(config).await.expect("asgi app should provision")
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wsgi_hello_world() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "wsgi_hello",
        r#"
def app(environ, start_response):
    start_response("200 OK", [("Content-Type", "text/plain")])
    return [b"Hello from Python"]
"#,
    );
    let app = provision_wsgi(dir.path(), "wsgi_hello").await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/plain")
    );
    assert_eq!(body_string(response).await, "Hello from Python");
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wsgi_environ_header_transformation() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "wsgi_environ",
        r#"
def app(environ, start_response):
    body = "|".join([
        environ.get("HTTP_COOKIE", ""),
        environ.get("HTTP_X_FOO", ""),
        environ.get("CONTENT_TYPE", ""),
        environ.get("X_FROM", ""),
        environ.get("wsgi.url_scheme", ""),
        environ["wsgi.input"].read().decode(),
    ]).encode()
    start_response("200 OK", [("Content-Type", "text/plain")])
    return [body]
"#,
    );
    let app = provision_wsgi(dir.path(), "wsgi_environ").await;

    let request = Request::builder()
        .uri("/echo?x=1")
        .method("POST")
        .header("Cookie", "a=1")
        .header("Cookie", "b=2")
        .header("X-Foo", "a")
        .header("X-Foo", "b")
        .header("Content-Type", "application/json")
        .header("Proxy", "smuggled")
        .body(Body::from("{\"k\":true}"))
        .unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "a=1; b=2|a, b|application/json|sidewinder|http|{\"k\":true}"
    );
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wsgi_non_bytes_body_is_an_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "wsgi_bad_body",
        r#"
def app(environ, start_response):
    start_response("200 OK", [("Content-Type", "text/plain")])
    return ["not bytes"]
"#,
    );
    let app = provision_wsgi(dir.path(), "wsgi_bad_body").await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "Internal Server Error");
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wsgi_import_failure_aborts_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let config = PythonAppConfig {
        module_wsgi: Some("does_not_exist_anywhere:app".to_string()),
        working_dir: Some(dir.path().to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        ..Default::default()
    };
    assert!(PythonApp::provision(config).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asgi_hello_world() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_hello",
        r#"
async def app(scope, receive, send):
    assert scope["type"] == "http"
    await send({
        "type": "http.response.start",
        "status": 200,
        "headers": [[b"content-type", b"text/plain"]],
    })
    await send({"type": "http.response.body", "body": b"Hello from ASGI"})
"#,
    );
    let app = provision_asgi(dir.path(), "asgi_hello").await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Hello from ASGI");
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asgi_receives_streamed_request_body() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_body_counter",
        r#"
async def app(scope, receive, send):
    total = 0
    events = 0
    while True:
        event = await receive()
        assert event["type"] == "http.request"
        total += len(event.get("body", b""))
        events += 1
        if not event.get("more_body", False):
            break
    payload = ("%d:%d" % (total, events)).encode()
    await send({
        "type": "http.response.start",
        "status": 200,
        "headers": [[b"content-type", b"text/plain"]],
    })
    await send({"type": "http.response.body", "body": payload})
"#,
    );
    let app = provision_asgi(dir.path(), "asgi_body_counter").await;

    // A body larger than one chunk arrives as several http.request events.
    let payload = vec![b'x'; 64 * 1024 + 500];
    let request = Request::builder()
        .uri("/")
        .method("POST")
        .body(Body::from(payload))
        .unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    let (total, events) = body.split_once(':').expect("count payload");
    assert_eq!(total, (64 * 1024 + 500).to_string());
    assert!(events.parse::<u32>().unwrap() >= 2);
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asgi_exception_cancels_the_request() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_raises",
        r#"
async def app(scope, receive, send):
    raise RuntimeError("boom")
"#,
    );
    let app = provision_asgi(dir.path(), "asgi_raises").await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "request cancelled");
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asgi_lifespan_state_reaches_request_scopes() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_lifespan",
        r#"
async def app(scope, receive, send):
    if scope["type"] == "lifespan":
        while True:
            event = await receive()
            if event["type"] == "lifespan.startup":
                scope["state"]["greeting"] = "prepared at startup"
                await send({"type": "lifespan.startup.complete"})
            elif event["type"] == "lifespan.shutdown":
                await send({"type": "lifespan.shutdown.complete"})
                return
    else:
        body = scope["state"]["greeting"].encode()
        await send({
            "type": "http.response.start",
            "status": 200,
            "headers": [[b"content-type", b"text/plain"]],
        })
        await send({"type": "http.response.body", "body": body})
"#,
    );
    let config = PythonAppConfig {
        module_asgi: Some("asgi_lifespan:app".to_string()),
        working_dir: Some(dir.path().to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        lifespan: Some(sidewinder_core::handler::LifespanMode::On),
        ..Default::default()
    };
    let app = PythonApp::provision(config).await.expect("lifespan startup should succeed");

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "prepared at startup");
    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_asgi_lifespan_startup_failure_aborts_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_lifespan_fails",
        r#"
async def app(scope, receive, send):
    assert scope["type"] == "lifespan"
    event = await receive()
    await send({"type": "lifespan.startup.failed", "message": "no database"})
"#,
    );
    let config = PythonAppConfig {
        module_asgi: Some("asgi_lifespan_fails:app".to_string()),
        working_dir: Some(dir.path().to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        lifespan: Some(sidewinder_core::handler::LifespanMode::On),
        ..Default::default()
    };
    assert!(PythonApp::provision(config).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_autoreload_swaps_the_app_and_reports_broken_reloads() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "reload_demo",
        r#"
def app(environ, start_response):
    start_response("200 OK", [("Content-Type", "text/plain")])
    return [b"version one"]
"#,
    );
    let config = PythonAppConfig {
        module_wsgi: Some("reload_demo:app".to_string()),
        working_dir: Some(dir.path().to_string_lossy().to_string()),
        workers_runtime: Some(WorkersRuntime::Thread),
        autoreload: true,
        ..Default::default()
    };
    let app = PythonApp::provision(config).await.unwrap();

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;
    assert_eq!(body_string(response).await, "version one");

    // A create-then-write burst inside the debounce window produces one
    // reload with the final contents.
    write_fixture(
        dir.path(),
        "reload_demo",
        r#"
def app(environ, start_response):
    start_response("200 OK", [("Content-Type", "text/plain")])
    return [b"version two"]
"#,
    );
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;
    assert_eq!(body_string(response).await, "version two");

    // A syntax error installs the sentinel app until the next good reload.
    write_fixture(dir.path(), "reload_demo", "def app(environ, start_response:\n");
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.handle(request, request_context()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.starts_with("Python app reload failed:"));

    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_websocket_echo_and_disconnect_code() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        "asgi_ws_echo",
        r#"
import os

MARKER = os.path.join(os.path.dirname(os.path.abspath(__file__)), "disconnect.txt")

async def app(scope, receive, send):
    assert scope["type"] == "websocket"
    while True:
        event = await receive()
        if event["type"] == "websocket.connect":
            await send({"type": "websocket.accept"})
        elif event["type"] == "websocket.receive":
            await send({"type": "websocket.send", "text": event.get("text", "")})
        elif event["type"] == "websocket.disconnect":
            with open(MARKER, "w") as marker:
                marker.write(str(event.get("code")))
            return
"#,
    );
    let app = Arc::new(provision_asgi(dir.path(), "asgi_ws_echo").await);

    // Serve the app on an ephemeral port so a real client can upgrade.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let handler_app = app.clone();
    let router = axum::Router::new().fallback(
        move |axum::extract::ConnectInfo(client_addr): axum::extract::ConnectInfo<SocketAddr>,
              request: Request<Body>| {
            let app = handler_app.clone();
            async move {
                let context = RequestContext {
                    client_addr,
                    server_addr: local_addr,
                    tls: false,
                };
                app.handle(request, context).await
            }
        },
    );
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{local_addr}/ws"))
        .await
        .expect("websocket handshake should succeed");

    socket.send(Message::Text("ping".to_string())).await.unwrap();
    let echoed = loop {
        match socket.next().await.expect("socket should stay open").unwrap() {
            Message::Text(text) => break text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(echoed, "ping");

    socket
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .unwrap();
    // Drain until the connection finishes closing.
    while let Some(Ok(_)) = socket.next().await {}

    // The application observed websocket.disconnect with the close code.
    let marker = dir.path().join("disconnect.txt");
    let mut recorded = String::new();
    for _ in 0..40 {
        if marker.exists() {
            recorded = std::fs::read_to_string(&marker).unwrap();
            if !recorded.is_empty() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(recorded, "1000");

    app.cleanup().await.unwrap();
}
