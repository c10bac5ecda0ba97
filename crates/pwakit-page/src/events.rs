//! # Page Events
//!
//! The `pwa:*` events a page exposes to its UI glue, and the observer
//! registry they are dispatched through.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Page-level event kinds. None carry a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageEvent {
    /// The install prompt was captured and can be replayed.
    #[serde(rename = "pwa:installable")]
    Installable,
    /// The app was installed.
    #[serde(rename = "pwa:installed")]
    Installed,
    #[serde(rename = "pwa:online")]
    Online,
    #[serde(rename = "pwa:offline")]
    Offline,
    /// A new version is installed and waiting.
    #[serde(rename = "pwa:updateavailable")]
    UpdateAvailable,
}

impl PageEvent {
    pub const ALL: [PageEvent; 5] = [
        PageEvent::Installable,
        PageEvent::Installed,
        PageEvent::Online,
        PageEvent::Offline,
        PageEvent::UpdateAvailable,
    ];

    /// Event type name as dispatched on the page.
    pub fn as_str(&self) -> &'static str {
        match self {
            PageEvent::Installable => "pwa:installable",
            PageEvent::Installed => "pwa:installed",
            PageEvent::Online => "pwa:online",
            PageEvent::Offline => "pwa:offline",
            PageEvent::UpdateAvailable => "pwa:updateavailable",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == name)
    }
}

impl fmt::Display for PageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by [`PageEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An event handler.
pub type EventHandler = Arc<dyn Fn(PageEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    by_kind: HashMap<PageEvent, Vec<(SubscriptionId, EventHandler)>>,
}

/// Observer list per event kind. Clones share the same registry.
#[derive(Clone, Default)]
pub struct PageEventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl PageEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for one event kind.
    pub fn subscribe<F>(&self, event: PageEvent, handler: F) -> SubscriptionId
    where
        F: Fn(PageEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.lock()
            .by_kind
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        for list in listeners.by_kind.values_mut() {
            if let Some(index) = list.iter().position(|(sub, _)| *sub == id) {
                list.remove(index);
                return true;
            }
        }
        false
    }

    /// Invoke every handler for `event`, in subscription order.
    /// Returns how many ran.
    pub fn dispatch(&self, event: PageEvent) -> usize {
        // Handlers may subscribe or dispatch themselves.
        let handlers: Vec<EventHandler> = self
            .lock()
            .by_kind
            .get(&event)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        trace!(event = %event, listeners = handlers.len(), "Dispatch");
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn has_listeners(&self, event: PageEvent) -> bool {
        self.lock()
            .by_kind
            .get(&event)
            .is_some_and(|list| !list.is_empty())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PageEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.lock();
        let count: usize = listeners.by_kind.values().map(Vec::len).sum();
        f.debug_struct("PageEventBus")
            .field("listener_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(bus: &PageEventBus, event: PageEvent) -> (SubscriptionId, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = bus.subscribe(event, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (id, hits)
    }

    #[test]
    fn test_event_names() {
        assert_eq!(PageEvent::Installable.as_str(), "pwa:installable");
        assert_eq!(PageEvent::UpdateAvailable.to_string(), "pwa:updateavailable");
        assert_eq!(PageEvent::from_name("pwa:offline"), Some(PageEvent::Offline));
        assert_eq!(PageEvent::from_name("offline"), None);
        assert_eq!(
            serde_json::to_string(&PageEvent::Installed).unwrap(),
            "\"pwa:installed\""
        );
    }

    #[test]
    fn test_dispatch_reaches_only_matching_kind() {
        let bus = PageEventBus::new();
        let (_, online) = counter(&bus, PageEvent::Online);
        let (_, offline) = counter(&bus, PageEvent::Offline);

        assert_eq!(bus.dispatch(PageEvent::Online), 1);
        assert_eq!(online.load(Ordering::SeqCst), 1);
        assert_eq!(offline.load(Ordering::SeqCst), 0);
        assert_eq!(bus.dispatch(PageEvent::Installed), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = PageEventBus::new();
        let (id, hits) = counter(&bus, PageEvent::Offline);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.dispatch(PageEvent::Offline);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!bus.has_listeners(PageEvent::Offline));
    }

    #[test]
    fn test_clones_share_listeners() {
        let bus = PageEventBus::new();
        let (_, hits) = counter(&bus, PageEvent::Installable);

        bus.clone().dispatch(PageEvent::Installable);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_dispatch() {
        let bus = PageEventBus::new();
        let (_, installed) = counter(&bus, PageEvent::Installed);
        let inner = bus.clone();
        bus.subscribe(PageEvent::Installable, move |_| {
            inner.dispatch(PageEvent::Installed);
        });

        bus.dispatch(PageEvent::Installable);
        assert_eq!(installed.load(Ordering::SeqCst), 1);
    }
}
