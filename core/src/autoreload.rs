use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pyo3::types::PyAnyMethods;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

use crate::app::{AppServer, RequestContext};
use crate::consts::RELOAD_DEBOUNCE;
use crate::errors::{AppStartError, CleanupError, DispatchError};
use crate::interpreter::{run_py, runtime_module};

/// Builds (or rebuilds) the wrapped application. Factories are reused on
/// every reload, so they capture the full app configuration.
pub type AppFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn AppServer>, AppStartError>> + Send + Sync>;

/// Atomic-swap facade that watches an application's working directory and
/// replaces the live app when Python sources change.
///
/// Request dispatch holds the read side of the swap lock for the duration
/// of the downstream call; a reload takes the write side, so in-flight
/// requests always finish against the app that accepted them.
pub struct AutoreloadApp {
    current: Arc<RwLock<Arc<dyn AppServer>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl AutoreloadApp {
    pub async fn wrap(working_dir: PathBuf, factory: AppFactory) -> Result<Self, AppStartError> {
        let initial = factory().await?;
        let current = Arc::new(RwLock::new(initial));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let filter_root = working_dir.clone();
        let mut watcher =
            notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
                if let Ok(event) = event {
                    if is_reload_event(&filter_root, &event) {
                        let _ = events_tx.send(());
                    }
                }
            })
            .map_err(|err| AppStartError::Io(io::Error::other(err)))?;
        watcher
            .watch(&working_dir, RecursiveMode::Recursive)
            .map_err(|err| AppStartError::Io(io::Error::other(err)))?;

        tokio::spawn(reload_loop(
            working_dir.clone(),
            current.clone(),
            factory,
            events_rx,
        ));

        info!(
            working_dir = %working_dir.display(),
            "autoreload enabled for python sources"
        );
        Ok(AutoreloadApp {
            current,
            watcher: Mutex::new(Some(watcher)),
        })
    }
}

#[async_trait]
impl AppServer for AutoreloadApp {
    async fn handle_request(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        let current = self.current.read().await;
        current.handle_request(request, context).await
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        // Dropping the watcher stops the event stream; the reload loop
        // exits once its channel drains, so no reload can fire afterwards.
        *self
            .watcher
            .lock()
            .expect("autoreload watcher lock should not be poisoned") = None;
        let current = self.current.read().await.clone();
        current.cleanup().await
    }
}

async fn reload_loop(
    working_dir: PathBuf,
    current: Arc<RwLock<Arc<dyn AppServer>>>,
    factory: AppFactory,
    mut events: mpsc::UnboundedReceiver<()>,
) {
    while events.recv().await.is_some() {
        // Debounce: every further event restarts the quiet window, so a
        // create-then-write burst produces a single reload.
        loop {
            match tokio::time::timeout(RELOAD_DEBOUNCE, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        reload(&working_dir, &current, &factory).await;
    }
}

async fn reload(
    working_dir: &Path,
    current: &Arc<RwLock<Arc<dyn AppServer>>>,
    factory: &AppFactory,
) {
    info!(
        working_dir = %working_dir.display(),
        "python sources changed, reloading app"
    );
    let mut current = current.write().await;

    invalidate_module_cache(working_dir).await;
    if let Err(err) = current.cleanup().await {
        error!("cleanup of previous app during reload failed: {err}");
    }
    match factory().await {
        Ok(app) => {
            *current = app;
            info!("python app reload complete");
        }
        Err(err) => {
            error!("python app reload failed: {err}");
            *current = Arc::new(ErrorApp::new(format!("Python app reload failed: {err}")));
        }
    }
}

/// Evicts every interpreter module whose source file lives under
/// `working_dir`, so the next import reloads it from disk.
pub(crate) async fn invalidate_module_cache(working_dir: &Path) {
    let dir = working_dir.to_string_lossy().to_string();
    run_py(move |py| {
        if let Err(err) = runtime_module(py).call_method1("invalidate_modules", (dir,)) {
            err.print(py);
        }
    })
    .await;
}

/// Filters watcher events down to the ones that warrant a reload:
/// writes, creates, removes and renames of `.py` files, excluding paths
/// under dot-directories, `__pycache__` and `node_modules`.
pub(crate) fn is_reload_event(root: &Path, event: &Event) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    );
    if !relevant_kind {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| is_python_source(root, path))
}

fn is_python_source(root: &Path, path: &Path) -> bool {
    if path.extension().and_then(|ext| ext.to_str()) != Some("py") {
        return false;
    }
    let relative = path.strip_prefix(root).unwrap_or(path);
    for component in relative.iter() {
        let Some(name) = component.to_str() else {
            continue;
        };
        if name.starts_with('.') || name == "__pycache__" || name == "node_modules" {
            return false;
        }
    }
    true
}

/// Sentinel installed when a reload fails: every request answers 500 with
/// the reconstructed error until the next successful reload.
pub struct ErrorApp {
    message: String,
}

impl ErrorApp {
    pub fn new(message: String) -> Self {
        ErrorApp { message }
    }
}

#[async_trait]
impl AppServer for ErrorApp {
    async fn handle_request(
        &self,
        _request: Request<Body>,
        _context: RequestContext,
    ) -> Result<Response, DispatchError> {
        Ok((StatusCode::INTERNAL_SERVER_ERROR, self.message.clone()).into_response())
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind};
    use pretty_assertions::assert_eq;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_python_writes_and_creates_trigger_reloads() {
        let root = Path::new("/srv/app");
        assert!(is_reload_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/srv/app/main.py"
            )
        ));
        assert!(is_reload_event(
            root,
            &event(EventKind::Create(CreateKind::File), "/srv/app/pkg/new.py")
        ));
        assert!(is_reload_event(
            root,
            &event(EventKind::Remove(notify::event::RemoveKind::File), "/srv/app/old.py")
        ));
    }

    #[test]
    fn test_non_python_files_are_ignored() {
        let root = Path::new("/srv/app");
        assert!(!is_reload_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/srv/app/notes.txt"
            )
        ));
    }

    #[test]
    fn test_cache_and_hidden_directories_are_ignored() {
        let root = Path::new("/srv/app");
        for path in [
            "/srv/app/__pycache__/main.cpython-312.py",
            "/srv/app/node_modules/pkg/setup.py",
            "/srv/app/.venv/lib/site.py",
        ] {
            assert!(!is_reload_event(
                root,
                &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), path)
            ));
        }
    }

    #[test]
    fn test_metadata_only_events_are_ignored() {
        let root = Path::new("/srv/app");
        assert!(!is_reload_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                "/srv/app/main.py"
            )
        ));
    }

    #[tokio::test]
    async fn test_error_app_reports_reload_failure() {
        let app = ErrorApp::new("Python app reload failed: boom".to_string());
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let context = RequestContext {
            client_addr: "127.0.0.1:5000".parse().unwrap(),
            server_addr: "127.0.0.1:9080".parse().unwrap(),
            tls: false,
        };
        let response = app.handle_request(request, context).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"Python app reload failed:"));
    }
}
