use std::sync::Arc;

use futures::Stream;
use tokio::sync::{Mutex, Notify};

use crate::cache::CachedEntry;
use crate::error::StoreError;

/// The conflated broadcast buffer holding the current value for observers:
/// a `Mutex`-guarded buffer woken by a `Notify`, holding a single slot with
/// terminal close/close-with-error states. Once `Closed`, a slot never
/// reopens and is discarded wholesale in favor of a fresh one.
#[derive(Clone)]
enum State<T> {
    Empty,
    Value(CachedEntry<T>),
    Closed(Option<StoreError>),
}

struct Inner<T> {
    state: State<T>,
    /// Bumped on every `publish`/`close`/`close_err`. Lets `observe()` tell
    /// "nothing new happened" apart from "the value happens to be identical
    /// to what I last saw" without comparing values.
    version: u64,
}

pub struct Slot<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone + Send + Sync + 'static> Slot<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: State::Empty,
                version: 0,
            }),
            notify: Notify::new(),
        })
    }

    pub async fn publish(&self, entry: CachedEntry<T>) {
        let mut guard = self.inner.lock().await;
        guard.state = State::Value(entry);
        guard.version += 1;
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = State::Closed(None);
        guard.version += 1;
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn close_err(&self, err: StoreError) {
        let mut guard = self.inner.lock().await;
        guard.state = State::Closed(Some(err));
        guard.version += 1;
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        matches!(self.inner.lock().await.state, State::Closed(_))
    }

    /// The current value, if any has been published yet.
    pub async fn current(&self) -> Option<T> {
        match &self.inner.lock().await.state {
            State::Value(entry) => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// The current cached entry (value + fingerprint), if any. Used
    /// internally by the message loop to run mutation-detection checks;
    /// observers only ever see [`Slot::current`]'s plain value.
    pub async fn current_entry(&self) -> Option<CachedEntry<T>> {
        match &self.inner.lock().await.state {
            State::Value(entry) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Blocks until the slot has left `Empty`: either a value was
    /// published, or the slot closed (cleanly or with an error). Used by
    /// `update()` to surface an initialization failure without waiting on
    /// the update's own `ack`.
    pub async fn wait_past_empty(&self) -> Result<(), StoreError> {
        loop {
            let snapshot = {
                let guard = self.inner.lock().await;
                match &guard.state {
                    State::Empty => None,
                    State::Value(_) => Some(Ok(())),
                    State::Closed(None) => Some(Ok(())),
                    State::Closed(Some(e)) => Some(Err(e.clone())),
                }
            };
            if let Some(result) = snapshot {
                return result;
            }
            self.notify.notified().await;
        }
    }

    /// A lazy sequence: the current value if present, then every
    /// subsequent successful publish, then completion (clean close) or a
    /// single trailing error (close with error). No buffering of
    /// intermediate values — a slow observer sees only the latest.
    pub fn observe(self: Arc<Self>) -> impl Stream<Item = Result<T, StoreError>> + Send + 'static {
        futures::stream::unfold((self, 0u64, false), |(slot, last_version, done)| async move {
            if done {
                return None;
            }
            loop {
                let (version, item) = {
                    let guard = slot.inner.lock().await;
                    let item: Option<Result<T, StoreError>> = match &guard.state {
                        State::Empty => None,
                        State::Value(entry) => Some(Ok(entry.value.clone())),
                        State::Closed(None) => None,
                        State::Closed(Some(e)) => Some(Err(e.clone())),
                    };
                    (guard.version, item)
                };
                if version > last_version {
                    return match item {
                        Some(result) => Some((result, (slot, version, false))),
                        None => None, // clean close, nothing left to emit
                    };
                }
                slot.notify.notified().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::serializer::fake::PlainIntSerializer;

    async fn entry(value: i32) -> CachedEntry<i32> {
        CachedEntry::new(&PlainIntSerializer, value).await.unwrap()
    }

    #[tokio::test]
    async fn late_subscriber_sees_current_value_first() {
        let slot = Slot::new();
        slot.publish(entry(1).await).await;
        slot.publish(entry(2).await).await;

        let mut stream = Box::pin(slot.observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn subsequent_publishes_are_observed_in_order() {
        let slot = Slot::new();
        let mut stream = Box::pin(slot.clone().observe());

        slot.publish(entry(1).await).await;
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        slot.publish(entry(2).await).await;
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn clean_close_ends_the_stream() {
        let slot = Slot::new();
        slot.publish(entry(1).await).await;
        let mut stream = Box::pin(slot.clone().observe());
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        slot.close().await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_close_is_delivered_then_the_stream_ends() {
        let slot = Slot::new();
        let mut stream = Box::pin(slot.clone().observe());

        slot.close_err(StoreError::MutationDetected).await;
        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(StoreError::MutationDetected)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_slot_stays_closed() {
        let slot = Slot::new();
        slot.close().await;
        assert!(slot.is_closed().await);
    }
}
