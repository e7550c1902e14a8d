use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use sidewinder_helpers::placeholders::{contains_placeholder, RequestPlaceholders};
use sidewinder_helpers::venv::site_packages_dir;
use tracing::{error, info, warn};

use crate::app::{load_app, AppDefinition, AppKind, AppServer, RequestContext};
use crate::autoreload::AutoreloadApp;
use crate::errors::{AppLoadError, AppStartError, CleanupError, ConfigError};
use crate::resolver::{DynamicAppResolver, ResolvedAppFactory, ResolvedTarget};
#[cfg(unix)]
use crate::workers::{WorkerCommand, WorkerPool};

/// Where the interpreter for an app lives: on a thread inside this
/// process, or in a pool of supervised subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkersRuntime {
    Thread,
    Process,
}

impl FromStr for WorkersRuntime {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "thread" => Ok(WorkersRuntime::Thread),
            "process" => Ok(WorkersRuntime::Process),
            other => Err(ConfigError::InvalidWorkersRuntime(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifespanMode {
    On,
    Off,
}

impl FromStr for LifespanMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "on" => Ok(LifespanMode::On),
            "off" => Ok(LifespanMode::Off),
            other => Err(ConfigError::InvalidLifespanMode(other.to_string())),
        }
    }
}

/// Configuration block for one embedded Python application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PythonAppConfig {
    pub module_wsgi: Option<String>,
    pub module_asgi: Option<String>,
    pub working_dir: Option<String>,
    pub venv: Option<String>,
    pub workers: Option<usize>,
    pub workers_runtime: Option<WorkersRuntime>,
    pub lifespan: Option<LifespanMode>,
    #[serde(default)]
    pub autoreload: bool,
}

impl PythonAppConfig {
    /// Checks the mutual-exclusion and shape rules and returns the kind of
    /// application the config describes.
    pub fn validate(&self) -> Result<AppKind, ConfigError> {
        let (kind, pattern) = match (&self.module_wsgi, &self.module_asgi) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingModules),
            (None, None) => return Err(ConfigError::MissingModule),
            (Some(pattern), None) => (AppKind::Wsgi, pattern),
            (None, Some(pattern)) => (AppKind::Asgi, pattern),
        };
        AppDefinition::parse_module_pattern(pattern)?;
        Ok(kind)
    }

    fn module_pattern(&self) -> &str {
        self.module_wsgi
            .as_deref()
            .or(self.module_asgi.as_deref())
            .unwrap_or_default()
    }
}

enum Target {
    InProcess(Arc<dyn AppServer>),
    Dynamic(Arc<DynamicAppResolver>),
    #[cfg(unix)]
    Workers(WorkerPool),
}

/// A provisioned Python application endpoint: the per-request entry point
/// the HTTP server hands requests to, and the owner of everything that
/// must be torn down on configuration change or shutdown.
pub struct PythonApp {
    target: Target,
}

impl PythonApp {
    pub async fn provision(config: PythonAppConfig) -> Result<Self, AppStartError> {
        let kind = config.validate()?;
        let module_pattern = config.module_pattern().to_string();

        let lifespan = match (kind, config.lifespan) {
            (AppKind::Asgi, Some(LifespanMode::On)) => true,
            (AppKind::Asgi, _) => false,
            (AppKind::Wsgi, Some(_)) => {
                warn!("lifespan only applies to ASGI apps, ignoring");
                false
            }
            (AppKind::Wsgi, None) => false,
        };

        let working_dir_pattern = config.working_dir.clone().unwrap_or_default();
        let venv_pattern = config.venv.clone().unwrap_or_default();
        let dynamic = contains_placeholder(&module_pattern)
            || contains_placeholder(&working_dir_pattern)
            || contains_placeholder(&venv_pattern);

        let runtime = resolve_runtime(&config, dynamic);
        #[cfg(unix)]
        if runtime == WorkersRuntime::Process {
            if config.autoreload {
                warn!("autoreload applies to the thread runtime only, ignoring");
            }
            let command = WorkerCommand {
                interface: kind,
                app: module_pattern,
                working_dir: config.working_dir.clone().map(PathBuf::from),
                venv: config.venv.clone().map(PathBuf::from),
                lifespan,
            };
            let count = config.workers.unwrap_or_else(default_worker_count);
            let pool = WorkerPool::provision(&command, count).await?;
            return Ok(PythonApp {
                target: Target::Workers(pool),
            });
        }
        #[cfg(not(unix))]
        let _ = runtime;

        if dynamic {
            let factory = resolved_app_factory(kind, lifespan);
            let resolver = DynamicAppResolver::new(
                module_pattern,
                working_dir_pattern,
                venv_pattern,
                config.autoreload,
                factory,
            );
            return Ok(PythonApp {
                target: Target::Dynamic(Arc::new(resolver)),
            });
        }

        let definition = build_definition(
            kind,
            &module_pattern,
            config.working_dir.as_deref(),
            config.venv.as_deref(),
            lifespan,
        )?;

        let app: Arc<dyn AppServer> = if config.autoreload {
            let watch_dir = match &definition.working_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().map_err(AppStartError::Io)?,
            };
            let factory_definition = definition.clone();
            let factory = Arc::new(move || {
                let definition = factory_definition.clone();
                let future: futures::future::BoxFuture<
                    'static,
                    Result<Arc<dyn AppServer>, AppStartError>,
                > = Box::pin(async move {
                    let app = load_app(definition).await?;
                    Ok(Arc::new(app) as Arc<dyn AppServer>)
                });
                future
            });
            Arc::new(AutoreloadApp::wrap(watch_dir, factory).await?)
        } else {
            Arc::new(load_app(definition).await?)
        };

        info!("python app provisioned");
        Ok(PythonApp {
            target: Target::InProcess(app),
        })
    }

    /// Serves one request. Dispatch failures are converted to their HTTP
    /// form here so the server loop stays infallible.
    pub async fn handle(&self, request: Request<Body>, context: RequestContext) -> Response {
        match &self.target {
            Target::InProcess(app) => match app.handle_request(request, context).await {
                Ok(response) => response,
                Err(err) => {
                    error!("python dispatch failed: {err}");
                    err.into_response()
                }
            },
            Target::Dynamic(resolver) => {
                let host = request_host(&request);
                let placeholders =
                    RequestPlaceholders::new(&host, Some(context.server_addr.port()));
                let app = match resolver.resolve(&placeholders).await {
                    Ok(app) => app,
                    Err(err) => {
                        error!("dynamic python app load failed: {err}");
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Python app load failed: {err}"),
                        )
                            .into_response();
                    }
                };
                match app.handle_request(request, context).await {
                    Ok(response) => response,
                    Err(err) => {
                        error!("python dispatch failed: {err}");
                        err.into_response()
                    }
                }
            }
            #[cfg(unix)]
            Target::Workers(pool) => match pool.forward(request, &context).await {
                Ok(response) => response,
                Err(err) => {
                    error!("worker proxy failed: {err}");
                    (StatusCode::BAD_GATEWAY, "python worker unavailable").into_response()
                }
            },
        }
    }

    pub async fn cleanup(&self) -> Result<(), CleanupError> {
        match &self.target {
            Target::InProcess(app) => app.cleanup().await,
            Target::Dynamic(resolver) => resolver.cleanup().await,
            #[cfg(unix)]
            Target::Workers(pool) => pool.cleanup().await,
        }
    }
}

fn resolve_runtime(config: &PythonAppConfig, dynamic: bool) -> WorkersRuntime {
    let requested = config.workers_runtime.unwrap_or(WorkersRuntime::Process);
    if requested == WorkersRuntime::Thread {
        return WorkersRuntime::Thread;
    }
    if cfg!(not(unix)) {
        warn!("process runtime is unsupported on this platform, forcing thread runtime");
        return WorkersRuntime::Thread;
    }
    if dynamic {
        // Worker children take a fixed app on their command line, so
        // per-request resolution cannot cross the process boundary.
        warn!("placeholders require per-request resolution, forcing thread runtime");
        return WorkersRuntime::Thread;
    }
    WorkersRuntime::Process
}

#[cfg(unix)]
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

fn resolved_app_factory(kind: AppKind, lifespan: bool) -> ResolvedAppFactory {
    Arc::new(move |target: ResolvedTarget| {
        let future: futures::future::BoxFuture<'static, Result<Arc<dyn AppServer>, AppStartError>> =
            Box::pin(async move {
                let working_dir = (!target.working_dir.is_empty()).then_some(target.working_dir);
                let venv = (!target.venv.is_empty()).then_some(target.venv);
                let definition = build_definition(
                    kind,
                    &target.module,
                    working_dir.as_deref(),
                    venv.as_deref(),
                    lifespan,
                )?;
                let app = load_app(definition).await?;
                Ok(Arc::new(app) as Arc<dyn AppServer>)
            });
        future
    })
}

fn build_definition(
    kind: AppKind,
    module_pattern: &str,
    working_dir: Option<&str>,
    venv: Option<&str>,
    lifespan: bool,
) -> Result<AppDefinition, AppStartError> {
    let (module, symbol) = AppDefinition::parse_module_pattern(module_pattern)?;
    let working_dir = match working_dir {
        Some(dir) => Some(
            PathBuf::from(dir)
                .canonicalize()
                .map_err(|err| AppStartError::Load(AppLoadError::WorkingDir(err)))?,
        ),
        None => None,
    };
    let site_packages = match venv {
        Some(venv) => Some(
            site_packages_dir(&PathBuf::from(venv))
                .map_err(|err| AppStartError::Load(AppLoadError::Venv(err)))?,
        ),
        None => None,
    };
    Ok(AppDefinition {
        kind,
        module,
        symbol,
        working_dir,
        site_packages,
        lifespan,
    })
}

fn request_host(request: &Request<Body>) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .or_else(|| request.uri().host().map(|host| host.to_string()))
        .unwrap_or_default()
}
