use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::FileBackend;
use crate::cache::CachedEntry;
use crate::error::{StoreError, UpdateError};
use crate::init::{self, InitTask};
use crate::reader;
use crate::serializer::{CorruptionHandler, Serializer};
use crate::slot::Slot;
use crate::writer;

/// A user transform, as submitted to [`crate::Store::update`]. Fallible:
/// any error it raises propagates to the caller's `ack` only, never to
/// observers.
pub type Transform<T> = Box<dyn FnOnce(&T) -> Result<T, anyhow::Error> + Send>;

/// A pending message. `slot` is the broadcast slot snapshot captured at
/// enqueue time, used only to detect that a prior message already failed
/// and closed it before this one was drained.
pub enum Message<T> {
    Read {
        slot: Arc<Slot<T>>,
    },
    Update {
        transform: Transform<T>,
        ack: oneshot::Sender<Result<T, UpdateError>>,
        slot: Arc<Slot<T>>,
    },
}

impl<T> Message<T> {
    fn captured_slot(&self) -> &Arc<Slot<T>> {
        match self {
            Message::Read { slot } => slot,
            Message::Update { slot, .. } => slot,
        }
    }
}

/// The pointer `Store` clones when it needs to capture "the current slot"
/// before enqueuing a message, and that the message loop swaps out for a
/// fresh slot on read failure. Guarded by a plain `std::sync::Mutex` rather
/// than an async one: every critical section is a single pointer clone,
/// never held across an await point.
pub(crate) type SharedSlot<T> = Arc<StdMutex<Arc<Slot<T>>>>;

pub(crate) fn current_slot<T: Clone + Send + Sync + 'static>(shared: &SharedSlot<T>) -> Arc<Slot<T>> {
    shared.lock().expect("slot pointer mutex poisoned").clone()
}

/// Everything the message loop needs to own across awaits, grouped so
/// `handle_message`'s signature stays readable. Constructed once by
/// `spawn` and threaded through by reference.
struct Collaborators<T> {
    backend: Arc<dyn FileBackend>,
    serializer: Arc<dyn Serializer<T>>,
    corruption_handler: Arc<dyn CorruptionHandler<T>>,
    path: PathBuf,
}

/// Spawn the message loop as a `tokio::spawn`-ed task: a single consumer
/// draining an unbounded command channel, with no dedicated OS thread —
/// this loop does no blocking I/O that would warrant one.
pub(crate) fn spawn<T>(
    mut commands: mpsc::UnboundedReceiver<Message<T>>,
    shared_slot: SharedSlot<T>,
    backend: Arc<dyn FileBackend>,
    serializer: Arc<dyn Serializer<T>>,
    corruption_handler: Arc<dyn CorruptionHandler<T>>,
    path: PathBuf,
    init_tasks: Vec<InitTask<T>>,
    cancel: CancellationToken,
) where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let collaborators = Collaborators {
        backend,
        serializer,
        corruption_handler,
        path,
    };

    tokio::spawn(async move {
        let mut pending_tasks: Option<Vec<InitTask<T>>> = if init_tasks.is_empty() {
            None
        } else {
            Some(init_tasks)
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let slot = current_slot(&shared_slot);
                    slot.close().await;
                    info!("store for {:?} cancelled, message loop exiting", collaborators.path);
                    break;
                }
                maybe_msg = commands.recv() => {
                    match maybe_msg {
                        None => {
                            debug!("command channel for {:?} closed, message loop exiting", collaborators.path);
                            break;
                        }
                        Some(msg) => {
                            handle_message(msg, &shared_slot, &collaborators, &mut pending_tasks).await;
                        }
                    }
                }
            }
        }
    });
}

async fn handle_message<T>(
    msg: Message<T>,
    shared_slot: &SharedSlot<T>,
    collaborators: &Collaborators<T>,
    pending_tasks: &mut Option<Vec<InitTask<T>>>,
) where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    // A message enqueued against a slot a prior failure already closed is
    // silently discarded: the observer that caused it already saw the
    // error via the slot.
    if msg.captured_slot().is_closed().await {
        debug!("discarding message enqueued against an already-closed slot");
        return;
    }

    let slot = current_slot(shared_slot);

    if let Err(err) = read_and_init_once(&slot, collaborators, pending_tasks).await {
        warn!("read/init failed for {:?}: {}", collaborators.path, err);
        let fresh = Slot::new();
        *shared_slot.lock().expect("slot pointer mutex poisoned") = fresh;
        slot.close_err(err).await;
        return;
    }

    match msg {
        Message::Read { .. } => {
            // The slot now carries the current value; nothing else to do.
        }
        Message::Update { transform, ack, .. } => {
            let result = transform_and_write(&slot, collaborators, transform).await;
            let _ = ack.send(result);
        }
    }
}

/// Idempotent: returns immediately if `slot` already holds a value.
/// Otherwise reads the current value from disk (recovering from corruption
/// if needed), runs any remaining initialization tasks exactly once, and
/// publishes the result.
async fn read_and_init_once<T>(
    slot: &Arc<Slot<T>>,
    collaborators: &Collaborators<T>,
    pending_tasks: &mut Option<Vec<InitTask<T>>>,
) -> Result<(), StoreError>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    if slot.current_entry().await.is_some() {
        return Ok(());
    }

    let value = reader::read_or_handle_corruption(
        collaborators.backend.as_ref(),
        collaborators.serializer.as_ref(),
        &collaborators.corruption_handler,
        &collaborators.path,
    )
    .await?;

    let value = if let Some(tasks) = pending_tasks.take() {
        match init::run_tasks(
            &tasks,
            value,
            collaborators.backend.clone(),
            collaborators.serializer.clone(),
            &collaborators.path,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                *pending_tasks = Some(tasks);
                return Err(e);
            }
        }
    } else {
        value
    };

    let entry = CachedEntry::new(collaborators.serializer.as_ref(), value).await?;
    slot.publish(entry).await;
    Ok(())
}

/// Runs the user transform against the current cached value, checks for
/// caller-side mutation before and after, and persists the result only if
/// it actually changed.
async fn transform_and_write<T>(
    slot: &Arc<Slot<T>>,
    collaborators: &Collaborators<T>,
    transform: Transform<T>,
) -> Result<T, UpdateError>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let entry = slot
        .current_entry()
        .await
        .expect("transform_and_write invoked before read_and_init_once populated the slot");
    entry.verify(collaborators.serializer.as_ref()).await?;

    let next = transform(&entry.value).map_err(UpdateError::Transform)?;

    // Detect mutation of the cached value by the transform closure itself
    // (e.g. via interior mutability), not just by later caller code.
    entry.verify(collaborators.serializer.as_ref()).await?;

    if next == entry.value {
        return Ok(entry.value);
    }

    writer::write(
        collaborators.backend.as_ref(),
        collaborators.serializer.as_ref(),
        &collaborators.path,
        &next,
    )
    .await?;

    let new_entry = CachedEntry::new(collaborators.serializer.as_ref(), next.clone()).await?;
    slot.publish(new_entry).await;

    Ok(next)
}
