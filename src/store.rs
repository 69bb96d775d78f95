use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use futures::Stream;
use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{FileBackend, StdFileBackend};
use crate::engine::{self, Message, SharedSlot, Transform};
use crate::error::{StoreError, UpdateError};
use crate::init::InitTask;
use crate::serializer::{CorruptionHandler, Serializer};
use crate::slot::Slot;

/// The engine surface: a durable, observable single value of type `T`,
/// backed by one file on disk. Construct with [`StoreBuilder`], then call
/// [`Store::observe`] to get a live stream of the current value or
/// [`Store::update`] to read-modify-write it.
///
/// `Store` is cheap to clone: every clone shares the same message loop,
/// the same broadcast slot, and the same cancellation token, making it a
/// thin handle over a single background task.
#[derive(Clone)]
pub struct Store<T> {
    path: PathBuf,
    commands: mpsc::UnboundedSender<Message<T>>,
    shared_slot: SharedSlot<T>,
    cancel: CancellationToken,
}

/// Builds a [`Store`] by assembling channels, a cancellation token, and a
/// background task from a handful of collaborators.
pub struct StoreBuilder<T> {
    path: PathBuf,
    backend: Arc<dyn FileBackend>,
    serializer: Arc<dyn Serializer<T>>,
    corruption_handler: Arc<dyn CorruptionHandler<T>>,
    init_tasks: Vec<InitTask<T>>,
    cancellation_token: Option<CancellationToken>,
}

impl<T> StoreBuilder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(path: impl Into<PathBuf>, serializer: impl Serializer<T>) -> Self {
        // Captured before `serializer` moves into the `Arc` below: the
        // default corruption handler resets to the same value the reader
        // falls back to when the target file is simply absent.
        let default_value = serializer.default_value();
        Self {
            path: path.into(),
            backend: Arc::new(StdFileBackend::new()),
            serializer: Arc::new(serializer),
            corruption_handler: Arc::new(crate::serializer::ResetTo(default_value)),
            init_tasks: Vec::new(),
            cancellation_token: None,
        }
    }

    /// Override the file backend (e.g. an in-memory fake for tests).
    pub fn with_backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Override the corruption handler. Defaults to resetting to the
    /// serializer's default value, which is `ResetTo`'s common case.
    pub fn with_corruption_handler(mut self, handler: Arc<dyn CorruptionHandler<T>>) -> Self {
        self.corruption_handler = handler;
        self
    }

    /// Append a one-shot initialization task. Tasks run in the order they
    /// were added, exactly once, the first time the store is touched.
    pub fn with_init_task(mut self, task: InitTask<T>) -> Self {
        self.init_tasks.push(task);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn build(self) -> Store<T> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared_slot: SharedSlot<T> = Arc::new(StdMutex::new(Slot::new()));
        let cancel = self.cancellation_token.unwrap_or_default();

        engine::spawn(
            command_rx,
            shared_slot.clone(),
            self.backend,
            self.serializer,
            self.corruption_handler,
            self.path.clone(),
            self.init_tasks,
            cancel.clone(),
        );

        debug!("store for {:?} built", self.path);

        Store {
            path: self.path,
            commands,
            shared_slot,
            cancel,
        }
    }
}

impl<T> Store<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A lazy, restartable, per-subscriber stream. Subscribing enqueues a
    /// `Read` against the slot captured at that moment, then the returned
    /// stream emits the current value followed by every subsequent
    /// publish, completing or erroring with that slot.
    pub fn observe(&self) -> impl Stream<Item = Result<T, StoreError>> + Send + 'static {
        let slot = engine::current_slot(&self.shared_slot);
        let _ = self.commands.send(Message::Read { slot: slot.clone() });
        slot.observe()
    }

    /// Enqueue a read-modify-write, and return the resulting value or the
    /// transform's/writer's error.
    ///
    /// If the captured slot has no value yet, first await one emission
    /// from it so that an initialization failure surfaces to this caller
    /// directly rather than only through `ack`. The `ack` await itself
    /// races nothing: it is driven by the engine's own task, so a
    /// cancelled caller simply stops waiting without cancelling the
    /// already-enqueued write.
    pub async fn update<F>(&self, transform: F) -> Result<T, UpdateError>
    where
        F: FnOnce(&T) -> Result<T, anyhow::Error> + Send + 'static,
    {
        let slot = engine::current_slot(&self.shared_slot);
        let (ack_tx, ack_rx) = oneshot::channel();

        let boxed: Transform<T> = Box::new(transform);
        self.commands
            .send(Message::Update {
                transform: boxed,
                ack: ack_tx,
                slot: slot.clone(),
            })
            .map_err(|_| UpdateError::Store(StoreError::Closed))?;

        // No-op if the slot already carries a value; otherwise blocks
        // until initialization finishes or fails, surfacing an init
        // failure here rather than only through `ack`.
        slot.wait_past_empty().await.map_err(UpdateError::Store)?;

        ack_rx.await.map_err(|_| UpdateError::Store(StoreError::Closed))?
    }

    /// Request cancellation: closes the broadcast slot without error and
    /// stops the message loop after draining no further messages.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex2;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::io::AsyncWrite;

    use super::*;
    use crate::backend::fake::MemoryBackend;
    use crate::error::CodecError;
    use crate::serializer::fake::PlainIntSerializer;

    fn dyn_backend(backend: &Arc<MemoryBackend>) -> Arc<dyn FileBackend> {
        backend.clone()
    }

    // Empty target, default 0.
    #[tokio::test]
    async fn observe_on_empty_store_yields_the_default_and_creates_no_file() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        assert!(!backend.has_file(&path));
    }

    // update(v -> v + 1) on a default-0 store.
    #[tokio::test]
    async fn update_on_default_store_persists_and_is_observable() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);

        let result = store.update(|v| Ok(v + 1)).await.unwrap();
        assert_eq!(result, 1);
        assert_eq!(backend.contents(&path).unwrap(), b"1".to_vec());

        // The observer subscribed before the update sees both values.
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn observer_subscribing_after_the_update_sees_only_the_latest() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        store.update(|v| Ok(v + 1)).await.unwrap();

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    }

    /// A serializer whose `decode` always reports corruption, used to park
    /// bytes on disk that no well-formed `i32` encoding could produce.
    struct GarbageSerializer;

    #[async_trait]
    impl Serializer<()> for GarbageSerializer {
        fn default_value(&self) {}
        fn decode(&self, _bytes: &[u8]) -> Result<(), CodecError> {
            Err(CodecError::new("always corrupt"))
        }
        async fn encode(&self, _value: &(), writer: &mut (dyn AsyncWrite + Unpin + Send)) -> std::io::Result<()> {
            use tokio::io::AsyncWriteExt;
            writer.write_all(b"not an int").await
        }
    }

    // Corruption on first read, handler returns 7.
    #[tokio::test]
    async fn corrupt_file_is_recovered_via_the_corruption_handler() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        crate::writer::write(backend.as_ref(), &GarbageSerializer, &path, &())
            .await
            .unwrap();

        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .with_corruption_handler(Arc::new(crate::serializer::ResetTo(7)))
            .build();

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
        assert_eq!(backend.contents(&path).unwrap(), b"7".to_vec());
    }

    // Writer fails on update.
    #[tokio::test]
    async fn failed_write_fails_the_update_and_leaves_the_old_value_observable() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        // Force the scratch write for this update to fail.
        *backend.fail_write_to.lock().unwrap() = Some(crate::backend::scratch_path(&path));

        let err = store.update(|v| Ok(v + 1)).await.unwrap_err();
        assert!(matches!(err, UpdateError::Store(StoreError::Io(_))));

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        assert!(!backend.has_file(&crate::backend::scratch_path(&path)));
    }

    // Two overlapping updates, +1 and *2, starting from 3.
    #[tokio::test]
    async fn overlapping_updates_are_serialized_into_one_of_the_two_valid_orders() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();
        store.update(|v| Ok(*v + 3)).await.unwrap(); // seed the value to 3

        let (a, b) = tokio::join!(store.update(|v| Ok(v + 1)), store.update(|v| Ok(v * 2)));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(
            (a, b) == (4, 8) || (a, b) == (6, 7),
            "got ({a}, {b}), which is neither valid arrival order"
        );
    }

    /// A value type whose equality and encoding are driven by a shared,
    /// externally-mutable cell, so a cheap `.clone()` of a returned value
    /// still points at the same underlying storage as the cached entry —
    /// used to exercise caller-side mutation of a value handed back by an
    /// update.
    #[derive(Clone)]
    struct Shared(Arc<StdMutex2<i32>>);

    impl Shared {
        fn new(v: i32) -> Self {
            Shared(Arc::new(StdMutex2::new(v)))
        }
        fn get(&self) -> i32 {
            *self.0.lock().unwrap()
        }
        fn set(&self, v: i32) {
            *self.0.lock().unwrap() = v;
        }
    }

    impl PartialEq for Shared {
        fn eq(&self, other: &Self) -> bool {
            self.get() == other.get()
        }
    }

    struct SharedSerializer;

    #[async_trait]
    impl Serializer<Shared> for SharedSerializer {
        fn default_value(&self) -> Shared {
            Shared::new(0)
        }
        fn decode(&self, bytes: &[u8]) -> Result<Shared, CodecError> {
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .map(Shared::new)
                .ok_or_else(|| CodecError::new("bad shared int"))
        }
        async fn encode(&self, value: &Shared, writer: &mut (dyn AsyncWrite + Unpin + Send)) -> std::io::Result<()> {
            use tokio::io::AsyncWriteExt;
            writer.write_all(value.get().to_string().as_bytes()).await
        }
    }

    // A transform's returned value is mutated in place
    // afterwards, via interior mutability shared with the cache entry.
    #[tokio::test]
    async fn mutating_a_returned_value_afterwards_fails_the_next_update() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path.clone(), SharedSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        let returned = store.update(|v| Ok(Shared::new(v.get() + 1))).await.unwrap();
        assert_eq!(returned.get(), 1);
        assert_eq!(backend.contents(&path).unwrap(), b"1".to_vec());

        // Caller-side programming error: mutate the value handed back.
        returned.set(999);

        let err = store.update(|v| Ok(v.clone())).await.unwrap_err();
        assert!(matches!(err, UpdateError::Store(StoreError::MutationDetected)));

        // The bad mutation never reached disk.
        assert_eq!(backend.contents(&path).unwrap(), b"1".to_vec());
    }

    #[tokio::test]
    async fn cancelling_the_store_closes_observers_without_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        let path = PathBuf::from("/store.txt");
        let store = StoreBuilder::new(path, PlainIntSerializer)
            .with_backend(dyn_backend(&backend))
            .build();

        let mut stream = Box::pin(store.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);

        store.cancel();
        // The message loop wakes on the same cancellation token and closes
        // the slot; awaiting the stream here suspends until that happens.
        assert!(stream.next().await.is_none());
    }
}
