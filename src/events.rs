//! Publish/subscribe channel for notifications produced deep inside
//! collaborators, such as artifact downloads.
//!
//! A listener lives exactly as long as the [`Subscription`] returned by
//! [`EventBus::subscribe`]. Dropping the subscription removes the listener,
//! so a request handler that subscribes for its own lifetime is cleaned up
//! on every exit path, including unwinding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    ArtifactDownloaded { artifact_id: String },
}

type Listener = Arc<dyn Fn(&BuildEvent) + Send + Sync>;
type Listeners = Mutex<Vec<(u64, Listener)>>;

/// Cloning yields another handle to the same set of listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    next: Arc<AtomicU64>,
    listeners: Arc<Listeners>,
}

impl EventBus {
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BuildEvent) + Send + Sync + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Delivers an event to every listener registered at the time of the
    /// call. Listeners run on the publishing thread, outside the lock.
    pub fn publish(&self, event: &BuildEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        tracing::trace!(?event, listeners = listeners.len(), "publishing event");

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Registration handle of one listener; unregisters it when dropped.
#[must_use = "dropping a subscription unregisters the listener immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloaded(id: &str) -> BuildEvent {
        BuildEvent::ArtifactDownloaded {
            artifact_id: id.to_string(),
        }
    }

    #[test]
    fn test_subscription_scoped_to_guard() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(vec![]));

        {
            let seen = seen.clone();
            let _sub = bus.subscribe(move |event| seen.lock().unwrap().push(event.clone()));
            assert_eq!(bus.listener_count(), 1);
            bus.publish(&downloaded("a"));
        }

        assert_eq!(bus.listener_count(), 0);
        bus.publish(&downloaded("b"));

        assert_eq!(*seen.lock().unwrap(), vec![downloaded("a")]);
    }

    #[test]
    fn test_unsubscribe_only_removes_own_listener() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));

        let first = {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _second = {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };

        first.unsubscribe();
        bus.publish(&downloaded("x"));

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::default());
        let inner = bus.clone();
        let held = Arc::new(Mutex::new(vec![]));
        let held_inner = held.clone();

        let _sub = bus.subscribe(move |_| {
            let sub = inner.subscribe(|_| {});
            held_inner.lock().unwrap().push(sub);
        });

        bus.publish(&downloaded("x"));
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn test_clones_share_listeners() {
        let bus = EventBus::default();
        let publisher = bus.clone();
        let seen = Arc::new(Mutex::new(vec![]));

        let seen_inner = seen.clone();
        let first = bus.subscribe(move |event| seen_inner.lock().unwrap().push(event.clone()));
        let second = publisher.subscribe(|_| {});
        assert_eq!(bus.listener_count(), 2);

        publisher.publish(&downloaded("a"));
        drop(first);
        drop(second);

        assert_eq!(publisher.listener_count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![downloaded("a")]);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::default();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        drop(sub);
    }
}
