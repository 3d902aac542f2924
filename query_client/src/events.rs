//! Lifecycle events and the listener registry that delivers them.

use crossbeam_channel::Sender;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::error::QueryError;
use crate::types::CancelReason;

/// Data-carrying lifecycle events.
///
/// Events hold no references back into the core, so the embedding layer can
/// move them onto whatever thread it treats as "main" before touching
/// shared state.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// Audio activation handshake started.
    ActivationStarted,
    /// Audio gate is open; capture bytes are accepted.
    Activated,
    /// Audio gate is closing.
    DeactivationStarted,
    /// Audio gate is closed again.
    Deactivated,
    /// Intermediate decoded result.
    Partial(Value),
    /// Final decoded result. Always preceded by a `Partial` carrying the
    /// same data, so partial and final observers stay consistent.
    Final(Value),
    /// Inbound binary payload addressed to this request (synthesized audio
    /// in the broader system; opaque here).
    Audio(Vec<u8>),
    /// The request failed; fired exactly once.
    Failed(QueryError),
    /// The request was cancelled; fired exactly once.
    Canceled(CancelReason),
}

impl RequestEvent {
    /// True for the exactly-once events that end a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestEvent::Final(_) | RequestEvent::Failed(_) | RequestEvent::Canceled(_)
        )
    }
}

/// Handle for removing a previously added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&RequestEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

/// Ordered listener registry.
///
/// Listeners are invoked in the order they were added. Emission never holds
/// the registry lock across a listener call, so a listener may subscribe,
/// unsubscribe, or cancel the request it is observing.
#[derive(Default)]
pub struct RequestEvents {
    inner: Mutex<RegistryInner>,
}

impl RequestEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Forward every event into a channel, for delivery on whatever thread
    /// the embedding application drains it from.
    pub fn forward_to_channel(&self, sender: Sender<RequestEvent>) -> ListenerId {
        self.subscribe(move |event| {
            // A dropped receiver just means nobody is listening anymore
            let _ = sender.send(event.clone());
        })
    }

    pub(crate) fn emit(&self, event: &RequestEvent) {
        let listeners: Vec<Listener> = {
            let inner = self.inner.lock().unwrap();
            inner
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_run_in_add_order() {
        let events = RequestEvents::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            events.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        events.emit(&RequestEvent::ActivationStarted);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let events = RequestEvents::new();
        let count = Arc::new(Mutex::new(0usize));

        let counter = Arc::clone(&count);
        let id = events.subscribe(move |_| *counter.lock().unwrap() += 1);

        events.emit(&RequestEvent::ActivationStarted);
        assert!(events.unsubscribe(id));
        events.emit(&RequestEvent::ActivationStarted);

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!events.unsubscribe(id));
    }

    #[test]
    fn test_forward_to_channel() {
        let events = RequestEvents::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        events.forward_to_channel(tx);

        events.emit(&RequestEvent::Activated);
        events.emit(&RequestEvent::Deactivated);

        assert_eq!(rx.try_recv().unwrap(), RequestEvent::Activated);
        assert_eq!(rx.try_recv().unwrap(), RequestEvent::Deactivated);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let events = Arc::new(RequestEvents::new());
        let count = Arc::new(Mutex::new(0usize));

        let registry = Arc::clone(&events);
        let counter = Arc::clone(&count);
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let id = events.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            if let Some(id) = slot_clone.lock().unwrap().take() {
                registry.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        events.emit(&RequestEvent::ActivationStarted);
        events.emit(&RequestEvent::ActivationStarted);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
