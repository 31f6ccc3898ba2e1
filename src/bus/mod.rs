//! A broadcasting signal hub keyed by topic.
//!
//! Messages are not queued: an `emit` wakes exactly the waiters registered
//! at that moment and deregisters them. A topic can be emitted to before it
//! exists; such messages drain away. `cleanup` resolves every pending wait
//! with the aborted flag set, so a hosting session can always tear down
//! without leaking waiters.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

pub struct SignalBus<T, M> {
    waiters: Mutex<HashMap<T, Vec<oneshot::Sender<M>>>>,
}

impl<T, M> SignalBus<T, M>
where
    T: Eq + Hash + Clone,
    M: Default + Send,
{
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Delivers `message` to every waiter currently registered on `topic`.
    /// Waiters are removed from the hub under the lock; the hand-off itself
    /// happens outside it. A send can only fail when the waiter gave up
    /// between deregistration and delivery, in which case the notification
    /// is discarded.
    pub fn emit(&self, topic: T, message: M)
    where
        M: Clone,
    {
        let waiters = {
            let mut map = self.waiters.lock().expect("signal bus lock poisoned");
            map.remove(&topic)
        };

        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(message.clone());
            }
        }
    }

    /// Blocks until `topic` is emitted to, returning `(message, false)`, or
    /// until the topic is cleaned up, returning `(M::default(), true)`.
    pub async fn wait(&self, topic: T) -> (M, bool) {
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.waiters.lock().expect("signal bus lock poisoned");
            map.entry(topic).or_default().push(tx);
        }

        match rx.await {
            Ok(message) => (message, false),
            Err(_) => (M::default(), true),
        }
    }

    /// Aborts every pending wait on `topic` and forgets the topic.
    pub fn cleanup(&self, topic: T) {
        let waiters = {
            let mut map = self.waiters.lock().expect("signal bus lock poisoned");
            map.remove(&topic)
        };
        // Dropping the senders resolves the receivers with the aborted flag.
        drop(waiters);
    }
}

impl<T, M> Default for SignalBus<T, M>
where
    T: Eq + Hash + Clone,
    M: Default + Send,
{
    fn default() -> Self {
        Self::new()
    }
}
