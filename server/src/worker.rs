use std::path::PathBuf;
use std::process::exit;

use clap::Args;
use sidewinder_core::workers::{run_worker, WorkerArgs};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::{InterfaceArg, LifespanArg, FAILED_STARTUP};

#[derive(Args)]
pub(crate) struct PythonWorkerArgs {
    #[arg(long, value_enum)]
    interface: InterfaceArg,
    /// The application to serve, as "module:symbol".
    #[arg(long)]
    app: String,
    #[arg(long = "working-dir")]
    working_dir: Option<PathBuf>,
    #[arg(long)]
    venv: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "off")]
    lifespan: LifespanArg,
    /// Unix socket to serve HTTP on for the supervisor.
    #[arg(long)]
    socket: PathBuf,
}

pub(crate) async fn run(args: PythonWorkerArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let worker_args = WorkerArgs {
        interface: args.interface.into(),
        app: args.app,
        working_dir: args.working_dir,
        venv: args.venv,
        lifespan: matches!(args.lifespan, LifespanArg::On),
        socket: args.socket,
    };
    if let Err(err) = run_worker(worker_args).await {
        error!("python worker failed to start: {err}");
        exit(FAILED_STARTUP);
    }
}
