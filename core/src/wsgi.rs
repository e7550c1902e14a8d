use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::HeaderName, request::Parts, HeaderValue, Request, StatusCode, Version};
use axum::response::Response;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::{AppDefinition, AppServer, RequestContext};
use crate::consts::{COMPLETION_CAPACITY, SERVER_IDENTITY};
use crate::errors::{AppLoadError, CleanupError, DispatchError};
use crate::interpreter::{run_py, runtime_module};
use crate::registry::ShardedRegistry;

pub(crate) static WSGI_REQUESTS: LazyLock<ShardedRegistry<WsgiHandle>> =
    LazyLock::new(ShardedRegistry::new);

/// Registry entry for an in-flight WSGI request; the completion callback
/// routes the finished response through `done` to the waiting task.
#[derive(Clone)]
pub(crate) struct WsgiHandle {
    pub done: mpsc::Sender<Result<WsgiResponse, DispatchError>>,
}

pub(crate) struct WsgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A synchronous WSGI application imported into the embedded interpreter.
///
/// Requests are translated into a PEP 3333 environ mapping, queued for the
/// interpreter-side worker thread, and answered through the completion
/// channel registered under the request id.
pub struct WsgiApp {
    definition: AppDefinition,
    callable: Arc<Py<PyAny>>,
}

impl WsgiApp {
    pub(crate) async fn load(definition: AppDefinition) -> Result<Self, AppLoadError> {
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
        .await?;

        debug!(
            module = %definition.module,
            symbol = %definition.symbol,
            "wsgi application imported"
        );
        Ok(WsgiApp {
            definition,
            callable: Arc::new(callable),
        })
    }
}

#[async_trait]
impl AppServer for WsgiApp {
    async fn handle_request(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        let (parts, body) = request.into_parts();
        // WSGI input must be seekable, so the body is buffered in full
        // before dispatch.
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|err| DispatchError::BodyRead(err.to_string()))?;

        let (done_tx, mut done_rx) = mpsc::channel(COMPLETION_CAPACITY);
        let request_id = WSGI_REQUESTS.register(WsgiHandle { done: done_tx });

        let callable = self.callable.clone();
        let dispatched = run_py(move |py| {
            let environ = match build_environ(py, &parts, &body, &context) {
                Ok(environ) => environ,
                Err(err) => return Err(DispatchError::from(err)),
            };
            let runtime = runtime_module(py);
            match runtime.call_method1("handle_wsgi", (request_id, callable.bind(py), environ)) {
                Ok(_) => Ok(()),
                Err(err) => {
                    let message = err.to_string();
                    err.print(py);
                    Err(DispatchError::Python(message))
                }
            }
        })
        .await;

        if let Err(err) = dispatched {
            WSGI_REQUESTS.unregister(request_id);
            return Err(err);
        }

        let outcome = done_rx.recv().await;
        WSGI_REQUESTS.unregister(request_id);

        let wsgi_response = match outcome {
            Some(Ok(response)) => response,
            Some(Err(err)) => return Err(err),
            None => return Err(DispatchError::ChannelClosed),
        };

        let status = StatusCode::from_u16(wsgi_response.status)
            .map_err(|err| DispatchError::Protocol(err.to_string()))?;
        let mut builder = Response::builder().status(status);
        for (name, value) in wsgi_response.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| DispatchError::Protocol(err.to_string()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| DispatchError::Protocol(err.to_string()))?;
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(wsgi_response.body))
            .map_err(|err| DispatchError::Protocol(err.to_string()))
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        debug!(
            module = %self.definition.module,
            symbol = %self.definition.symbol,
            "wsgi application released"
        );
        Ok(())
    }
}

fn build_environ<'py>(
    py: Python<'py>,
    parts: &Parts,
    body: &[u8],
    context: &RequestContext,
) -> PyResult<Bound<'py, PyDict>> {
    let environ = PyDict::new(py);
    environ.set_item("REQUEST_METHOD", parts.method.as_str())?;
    environ.set_item("SCRIPT_NAME", "")?;
    environ.set_item("PATH_INFO", parts.uri.path())?;
    environ.set_item("QUERY_STRING", parts.uri.query().unwrap_or(""))?;
    environ.set_item("SERVER_PROTOCOL", protocol_string(parts.version))?;
    environ.set_item("SERVER_NAME", context.server_addr.ip().to_string())?;
    environ.set_item("SERVER_PORT", context.server_addr.port().to_string())?;
    environ.set_item("REMOTE_ADDR", context.client_addr.ip().to_string())?;
    environ.set_item("REMOTE_PORT", context.client_addr.port().to_string())?;

    for name in parts.headers.keys() {
        let Some(environ_key) = environ_header_key(name.as_str()) else {
            continue;
        };
        let values: Vec<String> = parts
            .headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).to_string())
            .collect();
        environ.set_item(environ_key, join_header_values(name.as_str(), &values))?;
    }

    environ.set_item("wsgi.version", (1, 0))?;
    environ.set_item(
        "wsgi.url_scheme",
        if context.tls { "https" } else { "http" },
    )?;
    environ.set_item("wsgi.multithread", true)?;
    environ.set_item("wsgi.multiprocess", true)?;
    environ.set_item("wsgi.run_once", false)?;
    let input = py
        .import("io")?
        .call_method1("BytesIO", (PyBytes::new(py, body),))?;
    environ.set_item("wsgi.input", input)?;
    environ.set_item("wsgi.errors", py.import("sys")?.getattr("stderr")?)?;
    environ.set_item("X_FROM", SERVER_IDENTITY)?;
    Ok(environ)
}

/// Maps a request header name to its environ key: upper-cased with `-` and
/// `=` replaced by `_`, prefixed with `HTTP_` except for the two entity
/// headers CGI promotes to their own keys. `Proxy` is dropped entirely.
pub(crate) fn environ_header_key(name: &str) -> Option<String> {
    if name.eq_ignore_ascii_case("proxy") {
        return None;
    }
    if name.eq_ignore_ascii_case("content-type") {
        return Some("CONTENT_TYPE".to_string());
    }
    if name.eq_ignore_ascii_case("content-length") {
        return Some("CONTENT_LENGTH".to_string());
    }
    let mut key = String::with_capacity(name.len() + 5);
    key.push_str("HTTP_");
    for c in name.chars() {
        match c {
            '-' | '=' => key.push('_'),
            _ => key.push(c.to_ascii_uppercase()),
        }
    }
    Some(key)
}

/// Joins repeated header values: cookies with `"; "`, everything else with
/// `", "`.
pub(crate) fn join_header_values(name: &str, values: &[String]) -> String {
    let separator = if name.eq_ignore_ascii_case("cookie") {
        "; "
    } else {
        ", "
    };
    values.join(separator)
}

pub(crate) fn protocol_string(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_keys_are_upper_cased_and_prefixed() {
        assert_eq!(
            environ_header_key("X-Request-Id"),
            Some("HTTP_X_REQUEST_ID".to_string())
        );
        assert_eq!(
            environ_header_key("x=odd=name"),
            Some("HTTP_X_ODD_NAME".to_string())
        );
        assert_eq!(environ_header_key("accept"), Some("HTTP_ACCEPT".to_string()));
    }

    #[test]
    fn test_entity_headers_are_elevated() {
        assert_eq!(
            environ_header_key("Content-Type"),
            Some("CONTENT_TYPE".to_string())
        );
        assert_eq!(
            environ_header_key("content-length"),
            Some("CONTENT_LENGTH".to_string())
        );
    }

    #[test]
    fn test_proxy_header_is_dropped() {
        assert_eq!(environ_header_key("Proxy"), None);
        assert_eq!(environ_header_key("proxy"), None);
    }

    #[test]
    fn test_cookie_values_join_with_semicolons() {
        let joined = join_header_values("Cookie", &["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(joined, "a=1; b=2");
    }

    #[test]
    fn test_other_multi_values_join_with_commas() {
        let joined = join_header_values("X-Foo", &["a".to_string(), "b".to_string()]);
        assert_eq!(joined, "a, b");
    }

    #[test]
    fn test_protocol_passes_through_transport_version() {
        assert_eq!(protocol_string(Version::HTTP_11), "HTTP/1.1");
        assert_eq!(protocol_string(Version::HTTP_2), "HTTP/2.0");
    }
}
