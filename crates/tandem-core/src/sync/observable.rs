//! Observable view of a synced store
//!
//! Subscribing emits the current state immediately, then again after every
//! engine-level notification.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use super::engine::WeakSyncedStore;
use crate::listeners::Subscription;

/// Receives state emissions
pub trait Observer: Send + Sync {
    fn next(&self, state: &Value);
}

impl<F> Observer for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn next(&self, state: &Value) {
        self(state)
    }
}

/// Observable over a [`SyncedStore`](super::SyncedStore)'s state
#[derive(Clone)]
pub struct StateObservable {
    store: WeakSyncedStore,
}

impl StateObservable {
    pub(crate) fn new(store: WeakSyncedStore) -> Self {
        Self { store }
    }

    /// Emit the current state now and after every change
    ///
    /// Returns a no-op subscription if the store is gone.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer + 'static,
    {
        let Some(store) = self.store.upgrade() else {
            return Subscription::noop();
        };
        let observer = Arc::new(observer);
        observer.next(&store.get_state());

        let weak = store.downgrade();
        store.subscribe(move || {
            if let Some(store) = weak.upgrade() {
                observer.next(&store.get_state());
            }
        })
    }

    /// Consume the observable as a stream of states
    pub fn into_stream(self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |state: &Value| {
            let _ = tx.send(state.clone());
        });
        StateStream {
            rx,
            subscription: Some(subscription),
        }
    }
}

/// Stream of states; unsubscribes when dropped
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<Value>,
    subscription: Option<Subscription>,
}

impl Stream for StateStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for StateStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
