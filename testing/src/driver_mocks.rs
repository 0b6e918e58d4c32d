//! In-memory driver backends and request sinks
//!
//! - [`MemoryKvBackend`]: a key-value bucket understanding `get`, `set` and `delete`
//! - [`MemoryKvFactory`]: creates one [`MemoryKvBackend`] per bucket and counts them
//! - [`QueuedRequests`]: a [`RequestSink`] that queues requests for the test to dispatch

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use switchyard_core::driver::{
    BackendError, DriverRequest, Operation, OperationBackend, OperationBackendFactory,
    OperationOutcome,
};
use switchyard_core::transport::TransportError;
use switchyard_runtime::driver::RequestSink;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key-value bucket held in memory.
///
/// | Operation | Arguments                | Outcome                                |
/// |-----------|--------------------------|----------------------------------------|
/// | `get`     | `{"key"}`                | `Value(v)`, or `Rejected` when absent  |
/// | `set`     | `{"key", "value"}`       | `Done`                                 |
/// | `delete`  | `{"key"}`                | `Done`, or `Rejected` when absent      |
///
/// Anything else, or a missing `key`, is a [`BackendError`].
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use switchyard_core::driver::{Operation, OperationBackend, OperationOutcome};
/// use switchyard_testing::MemoryKvBackend;
///
/// let bucket = MemoryKvBackend::new();
/// bucket.execute(&Operation::new("set", json!({"key": "a", "value": 1}))).unwrap();
///
/// let read = bucket.execute(&Operation::new("get", json!({"key": "a"}))).unwrap();
/// assert_eq!(read, OperationOutcome::Value(json!(1)));
/// ```
#[derive(Debug, Default)]
pub struct MemoryKvBackend {
    entries: Mutex<HashMap<String, Value>>,
    closed: AtomicBool,
}

impl MemoryKvBackend {
    /// Create an empty bucket
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no key is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Whether [`OperationBackend::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn key(operation: &Operation) -> Result<String, BackendError> {
    operation
        .arguments
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::new(format!("`{}` needs a string `key`", operation.name)))
}

impl OperationBackend for MemoryKvBackend {
    fn execute(&self, operation: &Operation) -> Result<OperationOutcome, BackendError> {
        if self.is_closed() {
            return Err(BackendError::new("bucket is closed"));
        }
        let key = key(operation)?;
        let mut entries = lock(&self.entries);
        match operation.name.as_str() {
            "get" => Ok(entries
                .get(&key)
                .cloned()
                .map_or(OperationOutcome::Rejected, OperationOutcome::Value)),
            "set" => {
                let value = operation.arguments.get("value").cloned().unwrap_or(Value::Null);
                entries.insert(key, value);
                Ok(OperationOutcome::Done)
            },
            "delete" => Ok(if entries.remove(&key).is_some() {
                OperationOutcome::Done
            } else {
                OperationOutcome::Rejected
            }),
            other => Err(BackendError::new(format!("unsupported operation `{other}`"))),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Creates [`MemoryKvBackend`]s, one per bucket.
///
/// Buckets named in [`MemoryKvFactory::unavailable`] cannot be opened.
#[derive(Debug, Default)]
pub struct MemoryKvFactory {
    backends: Mutex<Vec<(String, Arc<MemoryKvBackend>)>>,
    unavailable: Mutex<Vec<String>>,
    created: AtomicUsize,
}

impl MemoryKvFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to open `bucket`
    pub fn unavailable(&self, bucket: impl Into<String>) {
        lock(&self.unavailable).push(bucket.into());
    }

    /// Number of backends created so far
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recently created backend for `bucket`
    #[must_use]
    pub fn backend(&self, bucket: &str) -> Option<Arc<MemoryKvBackend>> {
        lock(&self.backends)
            .iter()
            .rev()
            .find(|(name, _)| name == bucket)
            .map(|(_, backend)| Arc::clone(backend))
    }

    /// Number of created backends that were closed
    #[must_use]
    pub fn closed(&self) -> usize {
        lock(&self.backends)
            .iter()
            .filter(|(_, backend)| backend.is_closed())
            .count()
    }
}

impl OperationBackendFactory for MemoryKvFactory {
    fn create(&self, bucket: &str) -> Result<Arc<dyn OperationBackend>, BackendError> {
        if lock(&self.unavailable).iter().any(|name| name == bucket) {
            return Err(BackendError::new(format!("bucket `{bucket}` is unavailable")));
        }
        let backend = Arc::new(MemoryKvBackend::new());
        lock(&self.backends).push((bucket.to_string(), Arc::clone(&backend)));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(backend)
    }
}

/// Request sink that queues requests until the test takes them.
#[derive(Debug, Default)]
pub struct QueuedRequests {
    queue: Mutex<Vec<DriverRequest>>,
    closed: AtomicBool,
}

impl QueuedRequests {
    /// Create an open, empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued request, oldest first
    #[must_use]
    pub fn take(&self) -> Vec<DriverRequest> {
        std::mem::take(&mut *lock(&self.queue))
    }

    /// Refuse later submissions
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RequestSink for QueuedRequests {
    fn submit(&self, request: DriverRequest) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.queue).push(request);
        Ok(())
    }
}
