//! Connection plane + request plane: the requests endpoint (C3), the
//! acceptor/connection dispatcher (C7), the connector/pool (C8), the
//! bandwidth watcher (C9), and the connectivity checker (C13).

pub mod acceptor;
pub mod connection;
pub mod connector;
pub mod connectivity;
pub mod requests;
pub mod watcher;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// A boxed async handler, the "interface plus helper type" spec.md §9
/// recommends in place of the original's mixin-based dynamic dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type HandlerFn<E> = Box<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry mapping `msg_id` to a one-shot waiter, used by both the requests
/// endpoint (C3) and anywhere else a reply needs correlating.
///
/// Each registration resolves at most once (spec.md §8): a second resolve
/// attempt for the same id is a no-op, and `register_reply` always returns a
/// fresh receiver.
#[derive(Default)]
pub struct ReplyRegistry<T> {
    waiters: Mutex<HashMap<u64, oneshot::Sender<T>>>,
}

impl<T> ReplyRegistry<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in a reply for `msg_id`, returning a future that
    /// resolves when [`Self::resolve`] is called with the same id.
    pub fn register(&self, msg_id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(msg_id, tx);
        rx
    }

    /// Fulfill a waiter, if one is registered. Returns `true` if a waiter was
    /// found and notified (and thus consumed — a second call is a no-op).
    pub fn resolve(&self, msg_id: u64, value: T) -> bool {
        if let Some(tx) = self.waiters.lock().unwrap().remove(&msg_id) {
            let _ = tx.send(value);
            true
        } else {
            false
        }
    }

    pub fn is_awaited(&self, msg_id: u64) -> bool {
        self.waiters.lock().unwrap().contains_key(&msg_id)
    }

    pub fn cancel(&self, msg_id: u64) {
        self.waiters.lock().unwrap().remove(&msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_is_resolved_at_most_once() {
        let registry: ReplyRegistry<u32> = ReplyRegistry::new();
        let rx = registry.register(7);
        assert!(registry.resolve(7, 100));
        assert!(!registry.resolve(7, 200));
        assert_eq!(rx.await.unwrap(), 100);
    }

    #[test]
    fn unregistered_resolve_is_a_noop() {
        let registry: ReplyRegistry<u32> = ReplyRegistry::new();
        assert!(!registry.resolve(42, 1));
    }
}
