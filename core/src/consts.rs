use std::time::Duration;

// Identity string exposed to applications through the `X_FROM`
// WSGI environ key.
pub const SERVER_IDENTITY: &str = "sidewinder";

// Inbound request bodies are delivered to ASGI applications in chunks of
// at most this many bytes, each carrying `more_body=true` until the final
// chunk.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

// Number of partitions in each request registry; request IDs map to a
// partition by `id % REGISTRY_SHARDS`.
pub const REGISTRY_SHARDS: usize = 4;

// Capacity of the per-request operation queue drained by the request's
// consumer task.
pub const REQUEST_OP_CAPACITY: usize = 16;

// Capacity of the per-request completion channel. Two slots so a
// cancellation and a normal completion can never block each other.
pub const COMPLETION_CAPACITY: usize = 2;

// Quiet window after a source-file event before a reload fires; further
// events inside the window restart it.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

// Grace period before dynamically resolved apps evicted by a source change
// are cleaned up, letting in-flight requests finish.
pub const DYNAMIC_CLEANUP_GRACE: Duration = Duration::from_secs(10);

// Worker socket connect retries: base delay doubled on every attempt,
// covering the window between `exec` and the child's `listen`.
pub const WORKER_CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const WORKER_CONNECT_ATTEMPTS: u32 = 5;
