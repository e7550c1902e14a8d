use std::ffi::CString;
use std::sync::mpsc::{self, SyncSender};
use std::sync::OnceLock;
use std::thread;

use pyo3::prelude::*;
use pyo3::types::{PyList, PyModule};
use tracing::error;

use crate::native::_sidewinder;

/// Source for the Python-side runtime glue, compiled into the binary and
/// loaded into the interpreter at initialization.
const RUNTIME_SOURCE: &str = include_str!("python/runtime.py");
const RUNTIME_MODULE_NAME: &str = "sidewinder_runtime";

type Job = Box<dyn for<'py> FnOnce(Python<'py>) + Send + 'static>;

static HOST: OnceLock<InterpreterHost> = OnceLock::new();
static RUNTIME: OnceLock<Py<PyModule>> = OnceLock::new();

/// Owns the embedded interpreter. All interpreter entry is serialized
/// through one dedicated OS thread: callers submit closures over an
/// unbuffered channel and block until the closure has run with the
/// interpreter lock held on that thread.
pub struct InterpreterHost {
    jobs: SyncSender<Job>,
}

/// Returns the process-wide interpreter host, initializing the interpreter
/// on first use. Initialization failure aborts the process, there is no
/// usable degraded state without an interpreter.
pub fn interpreter() -> &'static InterpreterHost {
    HOST.get_or_init(InterpreterHost::start)
}

/// Returns the Python runtime glue module. Only callable from closures
/// already running on the interpreter thread.
pub(crate) fn runtime_module(py: Python<'_>) -> Bound<'_, PyModule> {
    RUNTIME
        .get()
        .expect("interpreter host should be initialized before use")
        .bind(py)
        .clone()
}

impl InterpreterHost {
    fn start() -> Self {
        // The native callback module must be registered before the
        // interpreter itself is initialized.
        pyo3::append_to_inittab!(_sidewinder);

        let (jobs_tx, jobs_rx) = mpsc::sync_channel::<Job>(0);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        thread::Builder::new()
            .name("python-interpreter".to_string())
            .spawn(move || {
                pyo3::prepare_freethreaded_python();
                let init_result = Python::with_gil(|py| match bootstrap(py) {
                    Ok(module) => {
                        let _ = RUNTIME.set(module.unbind());
                        Ok(())
                    }
                    Err(err) => {
                        let message = err.to_string();
                        err.print(py);
                        Err(message)
                    }
                });
                let failed = init_result.is_err();
                let _ = ready_tx.send(init_result);
                if failed {
                    return;
                }
                while let Ok(job) = jobs_rx.recv() {
                    Python::with_gil(|py| job(py));
                }
            })
            .expect("interpreter thread should spawn");

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                error!("python interpreter initialization failed: {message}");
                std::process::abort();
            }
            Err(_) => {
                error!("python interpreter thread exited during initialization");
                std::process::abort();
            }
        }

        InterpreterHost { jobs: jobs_tx }
    }

    /// Executes `f` on the interpreter thread with the interpreter lock
    /// held, blocking the caller until it completes.
    pub fn run<F, R>(&self, f: F) -> R
    where
        F: for<'py> FnOnce(Python<'py>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        self.jobs
            .send(Box::new(move |py| {
                let _ = done_tx.send(f(py));
            }))
            .expect("interpreter thread should be running");
        done_rx
            .recv()
            .expect("interpreter thread should complete submitted work")
    }
}

/// Async wrapper around [`InterpreterHost::run`] that keeps the submission
/// off the async executor threads.
pub async fn run_py<F, R>(f: F) -> R
where
    F: for<'py> FnOnce(Python<'py>) -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || interpreter().run(f))
        .await
        .expect("interpreter submission should not panic")
}

fn bootstrap(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    // An empty entry at the head of the module search path makes modules in
    // the process working directory importable, matching how applications
    // are launched directly with an interpreter.
    let sys = py.import("sys")?;
    let path = sys.getattr("path")?.downcast_into::<PyList>()?;
    path.insert(0, "")?;

    let source = CString::new(RUNTIME_SOURCE)
        .expect("embedded runtime source should not contain NUL bytes");
    let module = PyModule::from_code(py, source.as_c_str(), c"runtime.py", c"sidewinder_runtime")?;
    sys.getattr("modules")?
        .set_item(RUNTIME_MODULE_NAME, &module)?;

    module.call_method0("start_event_loop")?;
    module.call_method0("start_wsgi_worker")?;
    Ok(module)
}
