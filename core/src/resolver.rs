use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use sidewinder_helpers::placeholders::RequestPlaceholders;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::app::AppServer;
use crate::autoreload::{invalidate_module_cache, is_reload_event};
use crate::consts::{DYNAMIC_CLEANUP_GRACE, RELOAD_DEBOUNCE};
use crate::errors::{AppStartError, CleanupError};

/// A fully substituted `(module, working dir, venv)` triple for one
/// request, ready to be turned into an application.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub module: String,
    pub working_dir: String,
    pub venv: String,
}

pub type ResolvedAppFactory = Arc<
    dyn Fn(ResolvedTarget) -> BoxFuture<'static, Result<Arc<dyn AppServer>, AppStartError>>
        + Send
        + Sync,
>;

/// Resolves per-request placeholders into application instances.
///
/// The first resolver to reach a composite key creates the instance under
/// the write lock (re-checking after acquisition); every later request for
/// the same key takes the read-locked fast path and shares it.
pub struct DynamicAppResolver {
    module_pattern: String,
    working_dir_pattern: String,
    venv_pattern: String,
    autoreload: bool,
    factory: ResolvedAppFactory,
    apps: Arc<RwLock<HashMap<String, Arc<dyn AppServer>>>>,
    // Physical working directories are watched at most once; each maps to
    // the set of cache keys that resolved into it.
    dir_keys: Arc<StdMutex<HashMap<PathBuf, HashSet<String>>>>,
    watchers: StdMutex<HashMap<PathBuf, RecommendedWatcher>>,
}

pub(crate) fn composite_key(module: &str, working_dir: &str, venv: &str) -> String {
    format!("{module}|{working_dir}|{venv}")
}

impl DynamicAppResolver {
    pub fn new(
        module_pattern: String,
        working_dir_pattern: String,
        venv_pattern: String,
        autoreload: bool,
        factory: ResolvedAppFactory,
    ) -> Self {
        DynamicAppResolver {
            module_pattern,
            working_dir_pattern,
            venv_pattern,
            autoreload,
            factory,
            apps: Arc::new(RwLock::new(HashMap::new())),
            dir_keys: Arc::new(StdMutex::new(HashMap::new())),
            watchers: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns the application for the request's placeholder values,
    /// creating it on first use.
    pub async fn resolve(
        &self,
        placeholders: &RequestPlaceholders,
    ) -> Result<Arc<dyn AppServer>, AppStartError> {
        let module = placeholders.replace_all(&self.module_pattern);
        let working_dir = placeholders.replace_all(&self.working_dir_pattern);
        let venv = placeholders.replace_all(&self.venv_pattern);
        let key = composite_key(&module, &working_dir, &venv);

        if let Some(app) = self.apps.read().await.get(&key) {
            return Ok(app.clone());
        }

        let mut apps = self.apps.write().await;
        if let Some(app) = apps.get(&key) {
            return Ok(app.clone());
        }
        info!(key = %key, "creating python app for dynamic target");
        let app = (self.factory)(ResolvedTarget {
            module,
            working_dir: working_dir.clone(),
            venv,
        })
        .await?;
        apps.insert(key.clone(), app.clone());
        drop(apps);

        if self.autoreload && !working_dir.is_empty() {
            self.ensure_watch(Path::new(&working_dir), key);
        }
        Ok(app)
    }

    fn ensure_watch(&self, working_dir: &Path, key: String) {
        let physical = working_dir
            .canonicalize()
            .unwrap_or_else(|_| working_dir.to_path_buf());
        self.dir_keys
            .lock()
            .expect("resolver dir map lock should not be poisoned")
            .entry(physical.clone())
            .or_default()
            .insert(key);

        let mut watchers = self
            .watchers
            .lock()
            .expect("resolver watcher lock should not be poisoned");
        if watchers.contains_key(&physical) {
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let filter_root = physical.clone();
        let watcher = notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
            if let Ok(event) = event {
                if is_reload_event(&filter_root, &event) {
                    let _ = events_tx.send(());
                }
            }
        });
        let Ok(mut watcher) = watcher else {
            warn!(dir = %physical.display(), "could not create watcher for dynamic app dir");
            return;
        };
        if let Err(err) = watcher.watch(&physical, RecursiveMode::Recursive) {
            warn!(dir = %physical.display(), "could not watch dynamic app dir: {err}");
            return;
        }
        watchers.insert(physical.clone(), watcher);
        tokio::spawn(evict_loop(
            physical,
            self.apps.clone(),
            self.dir_keys.clone(),
            events_rx,
        ));
    }

    pub async fn cleanup(&self) -> Result<(), CleanupError> {
        self.watchers
            .lock()
            .expect("resolver watcher lock should not be poisoned")
            .clear();
        let apps: Vec<_> = self.apps.write().await.drain().collect();
        let mut failures = vec![];
        for (_, app) in apps {
            if let Err(err) = app.cleanup().await {
                failures.push(err);
            }
        }
        CleanupError::join(failures)
    }

    #[cfg(test)]
    async fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.apps.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

async fn evict_loop(
    working_dir: PathBuf,
    apps: Arc<RwLock<HashMap<String, Arc<dyn AppServer>>>>,
    dir_keys: Arc<StdMutex<HashMap<PathBuf, HashSet<String>>>>,
    mut events: mpsc::UnboundedReceiver<()>,
) {
    while events.recv().await.is_some() {
        loop {
            match tokio::time::timeout(RELOAD_DEBOUNCE, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        evict(&working_dir, &apps, &dir_keys).await;
    }
}

/// Drops every cache entry resolved into `working_dir` so the next request
/// rebuilds it, and cleans the evicted apps up once in-flight requests have
/// had a grace period to finish.
async fn evict(
    working_dir: &Path,
    apps: &Arc<RwLock<HashMap<String, Arc<dyn AppServer>>>>,
    dir_keys: &Arc<StdMutex<HashMap<PathBuf, HashSet<String>>>>,
) {
    let keys: Vec<String> = {
        let mut dir_keys = dir_keys
            .lock()
            .expect("resolver dir map lock should not be poisoned");
        dir_keys
            .get_mut(working_dir)
            .map(|keys| keys.drain().collect())
            .unwrap_or_default()
    };
    if keys.is_empty() {
        return;
    }
    info!(
        dir = %working_dir.display(),
        count = keys.len(),
        "python sources changed, evicting dynamic apps"
    );

    let mut evicted = vec![];
    {
        let mut apps = apps.write().await;
        for key in &keys {
            if let Some(app) = apps.remove(key) {
                evicted.push(app);
            }
        }
    }
    invalidate_module_cache(working_dir).await;

    tokio::spawn(async move {
        tokio::time::sleep(DYNAMIC_CLEANUP_GRACE).await;
        for app in evicted {
            if let Err(err) = app.cleanup().await {
                error!("cleanup of evicted dynamic app failed: {err}");
            }
        }
    });
}
