use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::TokioIo;
use sidewinder_helpers::retries::connect_retry_delay;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::app::{load_app, AppDefinition, AppKind, AppServer, RequestContext};
use crate::consts::{WORKER_CONNECT_ATTEMPTS, WORKER_CONNECT_BASE_DELAY};
use crate::errors::{AppLoadError, AppStartError, CleanupError, WorkerError};

/// The app configuration a supervisor passes to each of its children on
/// the command line.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub interface: AppKind,
    pub app: String,
    pub working_dir: Option<PathBuf>,
    pub venv: Option<PathBuf>,
    pub lifespan: bool,
}

/// Supervises a fixed set of subprocess workers, each serving the same
/// application over a private Unix domain socket, and spreads requests
/// across them round-robin.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `count` workers and waits until each one accepts connections
    /// on its socket.
    pub async fn provision(command: &WorkerCommand, count: usize) -> Result<WorkerPool, WorkerError> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let socket_path = std::env::temp_dir().join(format!(
                "sidewinder-worker-{}-{}.sock",
                std::process::id(),
                index
            ));
            let worker = Worker::spawn(command, socket_path).await?;
            workers.push(worker);
        }
        info!(count, "python worker pool ready");
        Ok(WorkerPool {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Forwards a request to the next worker in round-robin order.
    pub async fn forward(
        &self,
        request: Request<Body>,
        context: &RequestContext,
    ) -> Result<Response, WorkerError> {
        let index = advance(&self.next, self.workers.len());
        self.workers[index].forward(request, context).await
    }

    /// Terminates every worker with SIGTERM and removes its socket file.
    /// Failures are joined so one stubborn worker cannot mask the others.
    pub async fn cleanup(&self) -> Result<(), CleanupError> {
        let mut failures = vec![];
        for worker in &self.workers {
            worker.terminate(&mut failures).await;
        }
        CleanupError::join(failures)
    }
}

/// Advances the round-robin cursor; the returned index is always within
/// bounds and advancement is monotonic modulo the pool size.
fn advance(next: &AtomicUsize, len: usize) -> usize {
    next.fetch_add(1, Ordering::Relaxed) % len
}

struct Worker {
    socket_path: PathBuf,
    child: Mutex<Child>,
}

impl Worker {
    async fn spawn(command: &WorkerCommand, socket_path: PathBuf) -> Result<Worker, WorkerError> {
        // A stale socket from a previous run would make the child's bind fail.
        let _ = std::fs::remove_file(&socket_path);

        let exe = std::env::current_exe().map_err(WorkerError::Spawn)?;
        let mut child_command = Command::new(exe);
        child_command
            .arg("python-worker")
            .arg("--interface")
            .arg(match command.interface {
                AppKind::Wsgi => "wsgi",
                AppKind::Asgi => "asgi",
            })
            .arg("--app")
            .arg(&command.app)
            .arg("--lifespan")
            .arg(if command.lifespan { "on" } else { "off" })
            .arg("--socket")
            .arg(&socket_path);
        if let Some(working_dir) = &command.working_dir {
            child_command.arg("--working-dir").arg(working_dir);
        }
        if let Some(venv) = &command.venv {
            child_command.arg("--venv").arg(venv);
        }

        #[cfg(target_os = "linux")]
        unsafe {
            child_command.pre_exec(|| {
                // The child must not outlive a crashed supervisor.
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = child_command.spawn().map_err(WorkerError::Spawn)?;
        debug!(socket = %socket_path.display(), "python worker spawned");
        await_socket(&socket_path).await?;
        Ok(Worker {
            socket_path,
            child: Mutex::new(child),
        })
    }

    async fn forward(
        &self,
        mut request: Request<Body>,
        context: &RequestContext,
    ) -> Result<Response, WorkerError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *request.uri_mut() =
            Uri::try_from(path_and_query).map_err(|err| WorkerError::Proxy(err.to_string()))?;

        let headers = request.headers_mut();
        // The host header names the socket; the transport is plain HTTP/1.1.
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&self.socket_path.to_string_lossy())
                .unwrap_or_else(|_| HeaderValue::from_static("sidewinder-worker")),
        );
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if context.tls { "https" } else { "http" }),
        );
        if let Ok(client) = HeaderValue::from_str(&context.client_addr.to_string()) {
            headers.insert("x-forwarded-for", client);
        }

        // Keep the inbound upgrade half around so WebSocket requests can be
        // tunnelled through once the worker answers 101.
        let inbound_upgrade = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|err| WorkerError::Proxy(err.to_string()))?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| WorkerError::Proxy(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.with_upgrades().await {
                debug!("worker connection ended: {err}");
            }
        });
        let mut response = sender
            .send_request(request)
            .await
            .map_err(|err| WorkerError::Proxy(err.to_string()))?;

        if response.status() == axum::http::StatusCode::SWITCHING_PROTOCOLS {
            if let Some(inbound_upgrade) = inbound_upgrade {
                let outbound_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    let joined = tokio::try_join!(inbound_upgrade, outbound_upgrade);
                    match joined {
                        Ok((inbound, outbound)) => {
                            let mut inbound = TokioIo::new(inbound);
                            let mut outbound = TokioIo::new(outbound);
                            if let Err(err) =
                                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
                            {
                                debug!("worker upgrade tunnel closed: {err}");
                            }
                        }
                        Err(err) => debug!("worker upgrade failed: {err}"),
                    }
                });
            }
        }
        Ok(response.map(Body::new))
    }

    async fn terminate(&self, failures: &mut Vec<CleanupError>) {
        let mut child = self.child.lock().await;
        if let Some(pid) = child.id() {
            // SIGTERM rather than SIGKILL so the child can run app cleanup.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                failures.push(CleanupError::Worker(format!(
                    "failed to signal worker {pid}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if let Err(err) = child.wait().await {
                failures.push(CleanupError::Worker(format!(
                    "failed to await worker {pid}: {err}"
                )));
            }
        }
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                failures.push(CleanupError::Io(err));
            }
        }
    }
}

/// Polls the worker socket on the backoff schedule, covering the window
/// between `exec` and the child's `listen`.
async fn await_socket(socket_path: &Path) -> Result<(), WorkerError> {
    let mut last_error = None;
    for attempt in 0..WORKER_CONNECT_ATTEMPTS {
        tokio::time::sleep(connect_retry_delay(WORKER_CONNECT_BASE_DELAY, attempt)).await;
        match UnixStream::connect(socket_path).await {
            Ok(_) => return Ok(()),
            Err(err) => last_error = Some(err),
        }
    }
    Err(WorkerError::Connect {
        socket_path: socket_path.to_path_buf(),
        attempts: WORKER_CONNECT_ATTEMPTS,
        last_error: last_error
            .unwrap_or_else(|| std::io::Error::other("no connection attempts made")),
    })
}

/// Arguments of the internal `python-worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub interface: AppKind,
    pub app: String,
    pub working_dir: Option<PathBuf>,
    pub venv: Option<PathBuf>,
    pub lifespan: bool,
    pub socket: PathBuf,
}

/// Entry point for the worker child: imports the application in-process
/// and serves it over the private Unix socket until SIGTERM.
pub async fn run_worker(args: WorkerArgs) -> Result<(), AppStartError> {
    let (module, symbol) = AppDefinition::parse_module_pattern(&args.app)?;
    let working_dir = match &args.working_dir {
        Some(dir) => Some(
            dir.canonicalize()
                .map_err(|err| AppStartError::Load(AppLoadError::WorkingDir(err)))?,
        ),
        None => None,
    };
    let site_packages = match &args.venv {
        Some(venv) => Some(
            sidewinder_helpers::venv::site_packages_dir(venv)
                .map_err(|err| AppStartError::Load(AppLoadError::Venv(err)))?,
        ),
        None => None,
    };
    let definition = AppDefinition {
        kind: args.interface,
        module,
        symbol,
        working_dir,
        site_packages,
        lifespan: args.lifespan,
    };
    let app: Arc<dyn AppServer> = Arc::new(load_app(definition).await?);

    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket).map_err(AppStartError::Io)?;
    info!(socket = %args.socket.display(), "python worker listening");

    let router = worker_router(app.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(AppStartError::Io)?;

    if let Err(err) = app.cleanup().await {
        warn!("worker app cleanup failed: {err}");
    }
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}

fn worker_router(app: Arc<dyn AppServer>) -> Router {
    Router::new().fallback(move |request: Request<Body>| {
        let app = app.clone();
        async move {
            let context = context_from_forwarded_headers(request.headers());
            match app.handle_request(request, context).await {
                Ok(response) => response,
                Err(err) => {
                    error!("worker dispatch failed: {err}");
                    err.into_response()
                }
            }
        }
    })
}

/// Reconstructs the request context the supervisor recorded in forwarding
/// headers; the Unix transport itself has no addresses to offer.
fn context_from_forwarded_headers(headers: &HeaderMap) -> RequestContext {
    let fallback: SocketAddr = "127.0.0.1:0".parse().expect("fallback address is valid");
    let client_addr = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .parse::<SocketAddr>()
                .ok()
                .or_else(|| value.parse().ok().map(|ip| SocketAddr::new(ip, 0)))
        })
        .unwrap_or(fallback);
    let tls = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    RequestContext {
        client_addr,
        server_addr: fallback,
        tls,
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler should register");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    #[test]
    fn test_round_robin_index_is_monotonic_modulo_length() {
        let next = AtomicUsize::new(0);
        let picks: Vec<usize> = (0..7).map(|_| advance(&next, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_forwarded_context_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3:55011".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());

        let context = context_from_forwarded_headers(&headers);
        assert_eq!(context.client_addr, "10.1.2.3:55011".parse().unwrap());
        assert!(context.tls);
    }

    #[test]
    fn test_missing_forwarded_headers_fall_back() {
        let context = context_from_forwarded_headers(&HeaderMap::new());
        assert_eq!(context.client_addr, "127.0.0.1:0".parse().unwrap());
        assert!(!context.tls);
    }

    #[tokio::test]
    async fn test_connect_retries_follow_the_backoff_schedule() {
        let missing = std::env::temp_dir().join("sidewinder-test-no-such-worker.sock");
        let started = Instant::now();
        let result = await_socket(&missing).await;
        let elapsed = started.elapsed();

        let Err(WorkerError::Connect { attempts, .. }) = result else {
            panic!("expected a connect failure");
        };
        assert_eq!(attempts, WORKER_CONNECT_ATTEMPTS);
        // 100 + 200 + 400 + 800 + 1600 ms of waiting before giving up.
        assert!(elapsed >= std::time::Duration::from_millis(3100));
    }
}
