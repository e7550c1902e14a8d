use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::Router;
use clap::Args;
use sidewinder_core::app::RequestContext;
use sidewinder_core::handler::{PythonApp, PythonAppConfig};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{InterfaceArg, LifespanArg, RuntimeArg, FAILED_STARTUP};

#[derive(Args)]
pub(crate) struct ServeArgs {
    /// Application protocol to speak with the app callable.
    #[arg(long = "server-type", value_enum, default_value = "wsgi")]
    server_type: InterfaceArg,
    /// The application to serve, as "module:symbol".
    #[arg(long)]
    app: String,
    /// Serve this host on the standard HTTPS port instead of --listen.
    #[arg(long)]
    domain: Option<String>,
    /// Listen address, e.g. ":9080" or "127.0.0.1:8000".
    #[arg(long, default_value = ":9080")]
    listen: String,
    /// Number of worker processes; defaults to the CPU count.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long = "workers-runtime", value_enum)]
    workers_runtime: Option<RuntimeArg>,
    /// Directory the application is imported from.
    #[arg(long = "working-dir")]
    working_dir: Option<String>,
    /// Virtual environment root; defaults to $VIRTUAL_ENV when set.
    #[arg(long)]
    venv: Option<String>,
    #[arg(long, value_enum)]
    lifespan: Option<LifespanArg>,
    /// Reload the application when .py files under the working dir change.
    #[arg(long)]
    autoreload: bool,
    /// Directory of static files to serve alongside the app.
    #[arg(long = "static-path")]
    static_path: Option<PathBuf>,
    /// Route prefix the static directory is mounted on.
    #[arg(long = "static-route", default_value = "/static")]
    static_route: String,
    #[arg(long)]
    debug: bool,
    /// Log one line per handled request.
    #[arg(long = "access-logs")]
    access_logs: bool,
}

pub(crate) async fn run(args: ServeArgs) {
    init_tracing(args.debug);

    // An activated virtualenv is the default when no --venv was given.
    let venv = args
        .venv
        .clone()
        .or_else(|| std::env::var("VIRTUAL_ENV").ok());

    let mut config = PythonAppConfig {
        working_dir: args.working_dir.clone(),
        venv,
        workers: args.workers,
        workers_runtime: args.workers_runtime.map(Into::into),
        lifespan: args.lifespan.map(Into::into),
        autoreload: args.autoreload,
        ..Default::default()
    };
    match args.server_type {
        InterfaceArg::Wsgi => config.module_wsgi = Some(args.app.clone()),
        InterfaceArg::Asgi => config.module_asgi = Some(args.app.clone()),
    }

    let python_app = match PythonApp::provision(config).await {
        Ok(app) => Arc::new(app),
        Err(err) => {
            error!("failed to start python app: {err}");
            exit(FAILED_STARTUP);
        }
    };

    let listen = if args.domain.is_some() {
        ":443".to_string()
    } else {
        args.listen.clone()
    };
    let server_addr = match parse_listen_addr(&listen) {
        Ok(addr) => addr,
        Err(message) => {
            error!("invalid listen address '{listen}': {message}");
            exit(FAILED_STARTUP);
        }
    };

    let mut router = Router::new();
    if let Some(static_path) = &args.static_path {
        router = router.nest_service(args.static_route.as_str(), ServeDir::new(static_path));
    }
    let handler_app = python_app.clone();
    let behind_tls = args.domain.is_some();
    let mut router = router.fallback(
        move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, request: Request<Body>| {
            let app = handler_app.clone();
            async move {
                let context = RequestContext {
                    client_addr,
                    server_addr,
                    tls: behind_tls,
                };
                app.handle(request, context).await
            }
        },
    );
    if args.access_logs {
        router = router.layer(TraceLayer::new_for_http());
    }

    let listener = match TcpListener::bind(server_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {server_addr}: {err}");
            exit(FAILED_STARTUP);
        }
    };
    if let Some(domain) = &args.domain {
        info!(domain = %domain, "serving python app on {server_addr}");
    } else {
        info!("serving python app on {server_addr}");
    }

    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(err) = served {
        error!("server error: {err}");
    }

    info!("shutting down python app");
    if let Err(err) = python_app.cleanup().await {
        error!("python app cleanup failed: {err}");
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Parses listen addresses of the `:port` and `host:port` forms.
fn parse_listen_addr(listen: &str) -> Result<SocketAddr, String> {
    if let Some(port) = listen.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| "port must be an integer".to_string())?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    listen
        .parse()
        .map_err(|_| "expected ':port' or 'host:port'".to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler should register");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler should register");
        info!("received ctrl-c, shutting down");
    }
}
