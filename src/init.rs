use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use log::info;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::FileBackend;
use crate::error::StoreError;
use crate::serializer::Serializer;
use crate::writer;

/// A one-shot bootstrap callback that may rewrite the value before it
/// becomes observable. Boxed so a `Store` can hold a heterogeneous, ordered
/// list of them.
pub type InitTask<T> = Box<
    dyn for<'a> Fn(&'a InitCapability<T>) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>
        + Send
        + Sync,
>;

/// The restricted read-modify-write capability handed to init tasks. Each
/// task may run any number of transform+persist cycles; persistence
/// happens only when the transform actually changes the value. A local
/// mutex serializes tasks against each other even though they already run
/// one at a time on the message loop, guarding against accidental re-entry.
pub struct InitCapability<T> {
    current: AsyncMutex<T>,
    backend: Arc<dyn FileBackend>,
    serializer: Arc<dyn Serializer<T>>,
    path: std::path::PathBuf,
    /// Flips to `true` once the owning task list has finished; further use
    /// is a programming error.
    retired: std::sync::atomic::AtomicBool,
}

impl<T> InitCapability<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn new(initial: T, backend: Arc<dyn FileBackend>, serializer: Arc<dyn Serializer<T>>, path: std::path::PathBuf) -> Self {
        Self {
            current: AsyncMutex::new(initial),
            backend,
            serializer,
            path,
            retired: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Apply `transform` to the current init-time value, persisting the
    /// result only if it differs from what was there.
    pub async fn update<F>(&self, transform: F) -> Result<T, StoreError>
    where
        F: FnOnce(&T) -> T + Send,
    {
        if self.retired.load(std::sync::atomic::Ordering::Acquire) {
            return Err(StoreError::InitAfterComplete);
        }
        let mut guard = self.current.lock().await;
        let next = transform(&guard);
        if next != *guard {
            writer::write(self.backend.as_ref(), self.serializer.as_ref(), &self.path, &next).await?;
            *guard = next.clone();
        }
        Ok(guard.clone())
    }

    fn into_value(self) -> T {
        self.current.into_inner()
    }

    fn retire(&self) {
        self.retired.store(true, std::sync::atomic::Ordering::Release);
    }
}

/// Run every task in `tasks`, in order, against a single `InitCapability`
/// seeded with `initial`. On success the capability is retired and the
/// final value returned; on failure the tasks are left untouched by the
/// caller so the next message retries the whole list from the start.
pub async fn run_tasks<T>(
    tasks: &[InitTask<T>],
    initial: T,
    backend: Arc<dyn FileBackend>,
    serializer: Arc<dyn Serializer<T>>,
    path: &Path,
) -> Result<T, StoreError>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    if tasks.is_empty() {
        return Ok(initial);
    }
    info!("running {} initialization task(s) for {:?}", tasks.len(), path);
    let cap = InitCapability::new(initial, backend, serializer, path.to_path_buf());
    for task in tasks {
        task(&cap).await?;
    }
    cap.retire();
    Ok(cap.into_value())
}
