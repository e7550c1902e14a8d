use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};

use sidewinder_core::app::{AppServer, RequestContext};
use sidewinder_core::autoreload::{AppFactory, AutoreloadApp};
use sidewinder_core::errors::{AppStartError, CleanupError, DispatchError};

mod common;

use common::request_context;

struct SlowApp {
    delay: Duration,
}

#[async_trait]
impl AppServer for SlowApp {
    async fn handle_request(
        &self,
        _request: Request<Body>,
        _context: RequestContext,
    ) -> Result<Response, DispatchError> {
        tokio::time::sleep(self.delay).await;
        Ok("done".into_response())
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        Ok(())
    }
}

fn counting_factory(
    delay: Duration,
    built: Arc<AtomicUsize>,
    build_times: Arc<Mutex<Vec<Instant>>>,
) -> AppFactory {
    Arc::new(move || {
        let built = built.clone();
        let build_times = build_times.clone();
        let future: futures::future::BoxFuture<
            'static,
            Result<Arc<dyn AppServer>, AppStartError>,
        > = Box::pin(async move {
            built.fetch_add(1, Ordering::SeqCst);
            build_times.lock().unwrap().push(Instant::now());
            Ok(Arc::new(SlowApp { delay }) as Arc<dyn AppServer>)
        });
        future
    })
}

fn touch(dir: &std::path::Path, name: &str) {
    std::fs::write(dir.join(name), "x = 1\n").unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_event_burst_inside_the_debounce_window_reloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let built = Arc::new(AtomicUsize::new(0));
    let build_times = Arc::new(Mutex::new(vec![]));
    let factory = counting_factory(Duration::ZERO, built.clone(), build_times);

    let app = AutoreloadApp::wrap(dir.path().to_path_buf(), factory)
        .await
        .unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // Create-then-write burst within the debounce window.
    touch(dir.path(), "a.py");
    tokio::time::sleep(Duration::from_millis(50)).await;
    touch(dir.path(), "a.py");

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(built.load(Ordering::SeqCst), 2);

    app.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_reloads_fire_after_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let built = Arc::new(AtomicUsize::new(0));
    let build_times = Arc::new(Mutex::new(vec![]));
    let factory = counting_factory(Duration::ZERO, built.clone(), build_times);

    let app = AutoreloadApp::wrap(dir.path().to_path_buf(), factory)
        .await
        .unwrap();
    app.cleanup().await.unwrap();

    touch(dir.path(), "late.py");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_waits_for_in_flight_requests() {
    let dir = tempfile::tempdir().unwrap();
    let built = Arc::new(AtomicUsize::new(0));
    let build_times = Arc::new(Mutex::new(vec![]));
    let factory = counting_factory(
        Duration::from_millis(1500),
        built.clone(),
        build_times.clone(),
    );

    let app = Arc::new(
        AutoreloadApp::wrap(dir.path().to_path_buf(), factory)
            .await
            .unwrap(),
    );

    let request_app = app.clone();
    let request = tokio::spawn(async move {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let _ = request_app
            .handle_request(request, request_context())
            .await
            .unwrap();
        Instant::now()
    });

    // Give the request time to take the read lock, then change a source
    // file so a reload races it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    touch(dir.path(), "raced.py");

    let request_finished = request.await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(built.load(Ordering::SeqCst), 2);
    let swapped_at = build_times.lock().unwrap()[1];
    // The swap can only complete after the in-flight dispatch returned.
    assert!(swapped_at >= request_finished);

    app.cleanup().await.unwrap();
}
