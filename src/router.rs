//! Single-subscriber routing of inbound server messages by [`MessageKind`].
//!
//! Each kind has at most one live subscriber. Subscribing again replaces the
//! previous one (last writer wins) and ends the displaced subscriber's stream.
//! Disposing a [`Subscription`] removes its slot synchronously, so a message
//! dispatched afterwards can never reach it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{MessageKind, ServerMessage};

struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct RouterInner {
    next_id: u64,
    slots: BTreeMap<MessageKind, Slot>,
}

/// Routing table shared between the session loop and subscribers.
#[derive(Default)]
pub(crate) struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new subscriber for `kind`, replacing any existing one.
    pub(crate) fn subscribe(self: &Arc<Self>, kind: MessageKind) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        if inner.slots.insert(kind, Slot { id, tx }).is_some() {
            debug!(?kind, "replaced existing subscriber");
        }
        Subscription {
            kind,
            id,
            rx,
            router: Arc::downgrade(self),
        }
    }

    /// Removes the slot for `kind` if it still belongs to subscription `id`.
    pub(crate) fn unsubscribe(&self, kind: MessageKind, id: u64) -> bool {
        let mut inner = self.lock();
        match inner.slots.get(&kind) {
            Some(slot) if slot.id == id => {
                inner.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }

    /// Delivers `msg` to the subscriber of its kind.
    ///
    /// Returns the message back when nobody is subscribed (or the subscriber's
    /// receiver is gone) so the caller can decide what to do with it.
    pub(crate) fn dispatch(&self, msg: ServerMessage) -> Option<ServerMessage> {
        let kind = msg.kind();
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get(&kind) else {
            return Some(msg);
        };
        match slot.tx.send(msg) {
            Ok(()) => None,
            Err(mpsc::error::SendError(msg)) => {
                inner.slots.remove(&kind);
                Some(msg)
            }
        }
    }

    pub(crate) fn is_subscribed(&self, kind: MessageKind) -> bool {
        self.lock().slots.contains_key(&kind)
    }

    /// Drops every slot, ending all subscriber streams.
    pub(crate) fn close_all(&self) {
        let closed = std::mem::take(&mut self.lock().slots);
        if !closed.is_empty() {
            debug!(count = closed.len(), "closing all subscriptions");
        }
    }
}

/// Exclusive subscription to one [`MessageKind`].
///
/// Dropping it (or calling [`dispose`](Self::dispose)) unregisters it. The stream
/// ends when the connection goes away or a newer subscriber replaces this one.
#[derive(Debug)]
pub struct Subscription {
    kind: MessageKind,
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    router: Weak<Router>,
}

impl Subscription {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Waits for the next routed message. `None` once the stream has ended.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }

    /// Unregisters this subscription immediately.
    pub fn dispose(self) {}

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<MessageKind> = self.lock().slots.keys().copied().collect();
        f.debug_struct("Router").field("subscribed", &kinds).finish()
    }
}
