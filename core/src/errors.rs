use std::io;
use std::path::PathBuf;
use std::{error::Error, fmt};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pyo3::PyErr;
use sidewinder_helpers::venv::VenvError;

/// Provides a custom error type to be used for failures
/// in validating the plugin configuration.
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    MissingModule,
    ConflictingModules,
    InvalidWorkersRuntime(String),
    InvalidLifespanMode(String),
    InvalidModulePattern(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MissingModule => write!(
                f,
                "config error: one of module_wsgi or module_asgi must be set"
            ),
            ConfigError::ConflictingModules => write!(
                f,
                "config error: module_wsgi and module_asgi are mutually exclusive"
            ),
            ConfigError::InvalidWorkersRuntime(value) => write!(
                f,
                "config error: workers_runtime must be one of 'thread' or 'process', got '{value}'"
            ),
            ConfigError::InvalidLifespanMode(value) => write!(
                f,
                "config error: lifespan must be one of 'on' or 'off', got '{value}'"
            ),
            ConfigError::InvalidModulePattern(value) => write!(
                f,
                "config error: app module must take the form 'module:symbol', got '{value}'"
            ),
        }
    }
}

impl Error for ConfigError {}

/// Provides a custom error type to be used for failures
/// in importing a Python application callable.
#[derive(Debug)]
pub enum AppLoadError {
    Python(String),
    NotCallable(String),
    Venv(VenvError),
    WorkingDir(io::Error),
}

impl fmt::Display for AppLoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppLoadError::Python(import_error) => {
                write!(f, "app load error: {import_error}")
            }
            AppLoadError::NotCallable(symbol) => {
                write!(f, "app load error: '{symbol}' is not callable")
            }
            AppLoadError::Venv(venv_error) => write!(f, "app load error: {venv_error}"),
            AppLoadError::WorkingDir(io_error) => {
                write!(f, "app load error: invalid working directory: {io_error}")
            }
        }
    }
}

impl From<VenvError> for AppLoadError {
    fn from(error: VenvError) -> Self {
        AppLoadError::Venv(error)
    }
}

impl From<PyErr> for AppLoadError {
    fn from(error: PyErr) -> Self {
        AppLoadError::Python(error.to_string())
    }
}

/// Provides a custom error type to be used for failures
/// signalled by an ASGI application's lifespan protocol.
#[derive(Debug)]
pub enum LifespanError {
    StartupFailed,
    StartupException(String),
    ShutdownFailed,
    ShutdownException(String),
}

impl fmt::Display for LifespanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifespanError::StartupFailed => {
                write!(f, "lifespan error: application reported startup failure")
            }
            LifespanError::StartupException(exception) => {
                write!(f, "lifespan error: startup raised: {exception}")
            }
            LifespanError::ShutdownFailed => {
                write!(f, "lifespan error: application reported shutdown failure")
            }
            LifespanError::ShutdownException(exception) => {
                write!(f, "lifespan error: shutdown raised: {exception}")
            }
        }
    }
}

/// Provides a custom error type to be used for per-request
/// dispatch failures surfaced to HTTP clients.
#[derive(Debug)]
pub enum DispatchError {
    // The application raised during dispatch and the request was
    // cancelled from the Python side.
    Cancelled(String),
    // The application produced a malformed response
    // (non-bytes body items, missing headers, bad header tuples).
    Protocol(String),
    // Submitting work to the interpreter failed.
    Python(String),
    // Reading the inbound request body failed.
    BodyRead(String),
    // A WebSocket upgrade was rejected before the connection
    // was established.
    UpgradeRejected,
    // The per-request channels were torn down before a response arrived.
    ChannelClosed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Cancelled(reason) => write!(f, "request cancelled: {reason}"),
            DispatchError::Protocol(detail) => write!(f, "dispatch protocol error: {detail}"),
            DispatchError::Python(detail) => write!(f, "python dispatch error: {detail}"),
            DispatchError::BodyRead(detail) => write!(f, "request body error: {detail}"),
            DispatchError::UpgradeRejected => write!(f, "websocket upgrade rejected"),
            DispatchError::ChannelClosed => write!(f, "request completed without a response"),
        }
    }
}

impl From<PyErr> for DispatchError {
    fn from(error: PyErr) -> Self {
        DispatchError::Python(error.to_string())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::Cancelled(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "request cancelled").into_response()
            }
            DispatchError::UpgradeRejected => {
                (StatusCode::FORBIDDEN, "websocket upgrade rejected").into_response()
            }
            DispatchError::BodyRead(_) => {
                (StatusCode::BAD_REQUEST, "invalid request body").into_response()
            }
            DispatchError::Protocol(_) | DispatchError::Python(_) | DispatchError::ChannelClosed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

/// Provides a custom error type to be used for failures
/// in spawning or reaching subprocess workers.
#[derive(Debug)]
pub enum WorkerError {
    Spawn(io::Error),
    Connect {
        socket_path: PathBuf,
        attempts: u32,
        last_error: io::Error,
    },
    Proxy(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerError::Spawn(io_error) => write!(f, "worker error: spawn failed: {io_error}"),
            WorkerError::Connect {
                socket_path,
                attempts,
                last_error,
            } => write!(
                f,
                "worker error: could not connect to {} after {} attempts: {}",
                socket_path.display(),
                attempts,
                last_error
            ),
            WorkerError::Proxy(detail) => write!(f, "worker error: proxy failed: {detail}"),
        }
    }
}

/// Provides a custom error type to be used for failures
/// in starting an application.
#[derive(Debug)]
pub enum AppStartError {
    Config(ConfigError),
    Load(AppLoadError),
    Lifespan(LifespanError),
    Worker(WorkerError),
    Io(io::Error),
}

impl fmt::Display for AppStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppStartError::Config(config_error) => {
                write!(f, "application start error: {config_error}")
            }
            AppStartError::Load(load_error) => {
                write!(f, "application start error: {load_error}")
            }
            AppStartError::Lifespan(lifespan_error) => {
                write!(f, "application start error: {lifespan_error}")
            }
            AppStartError::Worker(worker_error) => {
                write!(f, "application start error: {worker_error}")
            }
            AppStartError::Io(io_error) => write!(f, "application start error: {io_error}"),
        }
    }
}

impl Error for AppStartError {}

impl From<ConfigError> for AppStartError {
    fn from(error: ConfigError) -> Self {
        AppStartError::Config(error)
    }
}

impl From<AppLoadError> for AppStartError {
    fn from(error: AppLoadError) -> Self {
        AppStartError::Load(error)
    }
}

impl From<LifespanError> for AppStartError {
    fn from(error: LifespanError) -> Self {
        AppStartError::Lifespan(error)
    }
}

impl From<WorkerError> for AppStartError {
    fn from(error: WorkerError) -> Self {
        AppStartError::Worker(error)
    }
}

impl From<io::Error> for AppStartError {
    fn from(error: io::Error) -> Self {
        AppStartError::Io(error)
    }
}

/// Provides a custom error type to be used for failures
/// during application teardown. Cleanup failures are joined,
/// never short-circuited, so partial failures stay observable.
#[derive(Debug)]
pub enum CleanupError {
    Lifespan(LifespanError),
    Worker(String),
    Io(io::Error),
    Many(Vec<CleanupError>),
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CleanupError::Lifespan(lifespan_error) => {
                write!(f, "cleanup error: {lifespan_error}")
            }
            CleanupError::Worker(detail) => write!(f, "cleanup error: {detail}"),
            CleanupError::Io(io_error) => write!(f, "cleanup error: {io_error}"),
            CleanupError::Many(errors) => {
                write!(f, "cleanup finished with {} failures: ", errors.len())?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<LifespanError> for CleanupError {
    fn from(error: LifespanError) -> Self {
        CleanupError::Lifespan(error)
    }
}

impl From<io::Error> for CleanupError {
    fn from(error: io::Error) -> Self {
        CleanupError::Io(error)
    }
}

impl CleanupError {
    /// Joins any number of cleanup failures into a single error,
    /// returning `Ok` when there were none.
    pub fn join(errors: Vec<CleanupError>) -> Result<(), CleanupError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(CleanupError::Many(errors)),
        }
    }
}
