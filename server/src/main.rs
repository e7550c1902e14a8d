use clap::{Parser, Subcommand, ValueEnum};
use sidewinder_core::app::AppKind;
use sidewinder_core::handler::{LifespanMode, WorkersRuntime};

mod serve;
#[cfg(unix)]
mod worker;

/// Exit code for any startup failure: invalid configuration, missing
/// interpreter, venv not found, import failure or lifespan startup failure.
pub(crate) const FAILED_STARTUP: i32 = 1;

#[derive(Parser)]
#[command(
    name = "sidewinder",
    version,
    about = "HTTP server that embeds Python WSGI and ASGI applications"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a Python WSGI or ASGI application over HTTP.
    #[command(alias = "python-server")]
    Serve(serve::ServeArgs),
    /// Internal subcommand: serve one app over a Unix socket for the
    /// process-runtime supervisor.
    #[cfg(unix)]
    #[command(name = "python-worker", hide = true)]
    PythonWorker(worker::PythonWorkerArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum InterfaceArg {
    Wsgi,
    Asgi,
}

impl From<InterfaceArg> for AppKind {
    fn from(value: InterfaceArg) -> AppKind {
        match value {
            InterfaceArg::Wsgi => AppKind::Wsgi,
            InterfaceArg::Asgi => AppKind::Asgi,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum RuntimeArg {
    Thread,
    Process,
}

impl From<RuntimeArg> for WorkersRuntime {
    fn from(value: RuntimeArg) -> WorkersRuntime {
        match value {
            RuntimeArg::Thread => WorkersRuntime::Thread,
            RuntimeArg::Process => WorkersRuntime::Process,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum LifespanArg {
    On,
    Off,
}

impl From<LifespanArg> for LifespanMode {
    fn from(value: LifespanArg) -> LifespanMode {
        match value {
            LifespanArg::On => LifespanMode::On,
            LifespanArg::Off => LifespanMode::Off,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve::run(args).await,
        #[cfg(unix)]
        Command::PythonWorker(args) => worker::run(args).await,
    }
}
