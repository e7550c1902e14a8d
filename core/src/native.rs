use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use tracing::debug;

use crate::asgi::{AsgiSendOp, DoneSignal, RequestOp, WsState, ASGI_REQUESTS};
use crate::errors::DispatchError;
use crate::wsgi::{WsgiResponse, WSGI_REQUESTS};

create_exception!(
    _sidewinder,
    WebSocketClosed,
    PyException,
    "Raised when the WebSocket connection backing an ASGI send has closed."
);

/// Completion callback for a WSGI request: the worker thread hands back the
/// status, header list and concatenated body produced by the application.
#[pyfunction]
fn wsgi_done(request_id: u64, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) {
    let Some(handle) = WSGI_REQUESTS.lookup(request_id) else {
        debug!(request_id, "wsgi completion for unknown request, dropping");
        return;
    };
    let _ = handle.done.try_send(Ok(WsgiResponse {
        status,
        headers,
        body,
    }));
}

/// Failure callback for a WSGI request. The traceback has already been
/// written to the error stream on the Python side; the request resolves
/// as an internal server error.
#[pyfunction]
fn wsgi_error(request_id: u64) {
    let Some(handle) = WSGI_REQUESTS.lookup(request_id) else {
        debug!(request_id, "wsgi failure for unknown request, dropping");
        return;
    };
    let _ = handle.done.try_send(Err(DispatchError::Protocol(
        "wsgi application failed to produce a response".to_string(),
    )));
}

/// Entry point for `await receive()`: asks the host to produce the next
/// inbound event for this request and wake the receive condition once the
/// payload is staged.
#[pyfunction]
fn asgi_receive_start(py: Python<'_>, request_id: u64) -> PyResult<()> {
    let Some(handle) = ASGI_REQUESTS.lookup(request_id) else {
        // The request already completed; fail the coroutine instead of
        // suspending it forever.
        return Err(PyRuntimeError::new_err("request is no longer active"));
    };
    let ops = handle.ops_sender();
    py.allow_threads(move || ops.blocking_send(RequestOp::ReceiveStart))
        .map_err(|_| PyRuntimeError::new_err("request is no longer active"))
}

/// Entry point for `await send(event)`: parses the ASGI event and queues
/// it on the request's operation channel in application order.
#[pyfunction]
fn asgi_send(py: Python<'_>, request_id: u64, event: Bound<'_, PyDict>) -> PyResult<()> {
    let op = parse_send_event(&event)?;
    let Some(handle) = ASGI_REQUESTS.lookup(request_id) else {
        if op.is_websocket() {
            return Err(WebSocketClosed::new_err("websocket connection is closed"));
        }
        return Err(PyRuntimeError::new_err("request is no longer active"));
    };
    if op.is_websocket() && handle.ws_state() == WsState::Disconnected {
        return Err(WebSocketClosed::new_err("websocket connection is closed"));
    }
    let ops = handle.ops_sender();
    py.allow_threads(move || ops.blocking_send(RequestOp::Send(op)))
        .map_err(|_| PyRuntimeError::new_err("request is no longer active"))
}

/// Done-callback for the scheduled application task. `error` carries the
/// rendered exception for anything other than a clean return; WebSocket
/// closure is collapsed into its own flag so the normal close path runs
/// without logging noise.
#[pyfunction]
#[pyo3(signature = (request_id, error, websocket_closed))]
fn asgi_done(request_id: u64, error: Option<String>, websocket_closed: bool) {
    let Some(handle) = ASGI_REQUESTS.lookup(request_id) else {
        debug!(request_id, "asgi completion for unknown request, dropping");
        return;
    };
    let signal = if websocket_closed {
        DoneSignal::WebSocketClosed
    } else if let Some(reason) = error {
        DoneSignal::Cancelled(reason)
    } else {
        DoneSignal::Finished
    };
    handle.signal_done(signal);
}

fn parse_send_event(event: &Bound<'_, PyDict>) -> PyResult<AsgiSendOp> {
    let event_type: String = match event.get_item("type")? {
        Some(value) => value.extract()?,
        None => return Err(PyValueError::new_err("ASGI event is missing 'type'")),
    };

    match event_type.as_str() {
        "http.response.start" => {
            let status: u16 = match event.get_item("status")? {
                Some(value) => value.extract()?,
                None => {
                    return Err(PyValueError::new_err(
                        "http.response.start is missing 'status'",
                    ))
                }
            };
            let headers = match event.get_item("headers")? {
                Some(value) => parse_header_pairs(&value)?,
                None => vec![],
            };
            Ok(AsgiSendOp::ResponseStart { status, headers })
        }
        "http.response.body" => {
            let body: Vec<u8> = match event.get_item("body")? {
                Some(value) => byteish(&value)?,
                None => vec![],
            };
            let more_body: bool = match event.get_item("more_body")? {
                Some(value) => value.extract()?,
                None => false,
            };
            Ok(AsgiSendOp::ResponseBody { body, more_body })
        }
        "websocket.accept" => {
            let subprotocol: Option<String> = match event.get_item("subprotocol")? {
                Some(value) => value.extract()?,
                None => None,
            };
            let headers = match event.get_item("headers")? {
                Some(value) => parse_header_pairs(&value)?,
                None => vec![],
            };
            Ok(AsgiSendOp::WsAccept {
                subprotocol,
                headers,
            })
        }
        "websocket.send" => {
            if let Some(text) = event.get_item("text")? {
                if !text.is_none() {
                    return Ok(AsgiSendOp::WsSendText(text.extract()?));
                }
            }
            if let Some(bytes) = event.get_item("bytes")? {
                if !bytes.is_none() {
                    return Ok(AsgiSendOp::WsSendBinary(byteish(&bytes)?));
                }
            }
            Err(PyValueError::new_err(
                "websocket.send requires one of 'text' or 'bytes'",
            ))
        }
        "websocket.close" => {
            let code: u16 = match event.get_item("code")? {
                Some(value) if !value.is_none() => value.extract()?,
                _ => 1000,
            };
            let reason: Option<String> = match event.get_item("reason")? {
                Some(value) if !value.is_none() => Some(value.extract()?),
                _ => None,
            };
            Ok(AsgiSendOp::WsClose { code, reason })
        }
        other => Err(PyValueError::new_err(format!(
            "unsupported ASGI event type '{other}'"
        ))),
    }
}

fn parse_header_pairs(value: &Bound<'_, PyAny>) -> PyResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut headers = vec![];
    for pair in value.try_iter()? {
        let pair = pair?;
        let name = byteish(&pair.get_item(0)?)?;
        let value = byteish(&pair.get_item(1)?)?;
        headers.push((name, value));
    }
    Ok(headers)
}

// Header names, values and bodies are byte strings on the wire; accept
// `str` as a convenience and encode it as UTF-8.
fn byteish(value: &Bound<'_, PyAny>) -> PyResult<Vec<u8>> {
    if let Ok(bytes) = value.extract::<Vec<u8>>() {
        return Ok(bytes);
    }
    let text: String = value.extract()?;
    Ok(text.into_bytes())
}

/// Native half of the embedded runtime: completion callbacks and the
/// receive/send bridge, keyed by the request id assigned at dispatch.
#[pymodule]
pub(crate) fn _sidewinder(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(wsgi_done, m)?)?;
    m.add_function(wrap_pyfunction!(wsgi_error, m)?)?;
    m.add_function(wrap_pyfunction!(asgi_receive_start, m)?)?;
    m.add_function(wrap_pyfunction!(asgi_send, m)?)?;
    m.add_function(wrap_pyfunction!(asgi_done, m)?)?;
    m.add("WebSocketClosed", m.py().get_type::<WebSocketClosed>())?;
    Ok(())
}
