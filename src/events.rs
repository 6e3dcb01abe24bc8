//! Lifecycle events and subscriber dispatch.
//!
//! Subscribers register per [`EventKind`] and are called synchronously, in
//! registration order, with the emitted [`Event`]. A panicking subscriber is
//! caught and logged; the remaining subscribers still run.
//!
//! # Example
//!
//! ```
//! use picore_w::events::{Event, EventBus, EventKind};
//!
//! let bus = EventBus::new();
//! let id = bus.on(EventKind::Disconnected, |event| println!("{:?}", event));
//! bus.emit(&Event::Disconnected);
//! assert!(bus.off(EventKind::Disconnected, id));
//! ```

use crate::state::ConnectionState;
use log::error;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Station link is up with the given address.
    Connected { ip: Ipv4Addr },
    /// A previously connected link went away.
    Disconnected,
    /// Any state transition.
    StateChange {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// The provisioning hotspot is up.
    ApModeStarted { ssid: String },
    /// Connection attempts were exhausted.
    ConnectionFailed { retry_count: u32 },
}

impl Event {
    /// The subscription kind this event is delivered to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::StateChange { .. } => EventKind::StateChange,
            Self::ApModeStarted { .. } => EventKind::ApModeStarted,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
        }
    }
}

/// Event categories that can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    StateChange,
    ApModeStarted,
    ConnectionFailed,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 5] = [
        Self::Connected,
        Self::Disconnected,
        Self::StateChange,
        Self::ApModeStarted,
        Self::ConnectionFailed,
    ];

    /// Wire name of the event (`"connected"`, `"state_change"`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::StateChange => "state_change",
            Self::ApModeStarted => "ap_mode_started",
            Self::ConnectionFailed => "connection_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// An event name that is not one of [`EventKind::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEvent(pub String);

impl fmt::Display for UnknownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let valid: Vec<&str> = EventKind::ALL.iter().map(|k| k.name()).collect();
        write!(f, "unknown event: {} (valid: {})", self.0, valid.join(", "))
    }
}

impl std::error::Error for UnknownEvent {}

/// Handle identifying one registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

type ListenerMap = HashMap<EventKind, Vec<(SubscriptionId, Callback)>>;

/// Ordered per-kind subscriber lists.
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<ListenerMap>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for `kind`. Callbacks run in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove one registration. Returns `false` if it was not registered
    /// for `kind`.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        list.len() != before
    }

    /// Remove every registration for `kind`, returning how many were removed.
    pub fn off_all(&self, kind: EventKind) -> usize {
        self.lock().remove(&kind).map_or(0, |list| list.len())
    }

    /// Number of subscribers for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to its subscribers.
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe
    /// or unsubscribe without deadlocking; such changes apply from the next
    /// emission.
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = match self.lock().get(&kind) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };

        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(
                    "Event callback error ({}): {}",
                    kind,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerMap> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(EventKind, usize)> = EventKind::ALL
            .iter()
            .map(|k| (*k, self.listener_count(*k)))
            .collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .finish()
    }
}

/// Extract a human-readable message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &'static str| -> Callback {
            let log = log_clone.clone();
            Arc::new(move |_event: &Event| log.lock().unwrap().push(tag.to_string()))
        };
        (log, make)
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        let third = make("third");
        bus.on(EventKind::Disconnected, move |e| first(e));
        bus.on(EventKind::Disconnected, move |e| second(e));
        bus.on(EventKind::Disconnected, move |e| third(e));

        bus.emit(&Event::Disconnected);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_kind_is_called() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let cb = make("connected");
        bus.on(EventKind::Connected, move |e| cb(e));

        bus.emit(&Event::Disconnected);
        assert!(log.lock().unwrap().is_empty());

        bus.emit(&Event::Connected {
            ip: Ipv4Addr::new(10, 0, 0, 5),
        });
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_off_removes_by_identity() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let id_a = bus.on(EventKind::StateChange, move |e| a(e));
        bus.on(EventKind::StateChange, move |e| b(e));

        assert!(bus.off(EventKind::StateChange, id_a));
        assert!(!bus.off(EventKind::StateChange, id_a));
        // Wrong kind does not remove anything
        assert!(!bus.off(EventKind::Connected, id_a));

        bus.emit(&Event::StateChange {
            old: ConnectionState::Idle,
            new: ConnectionState::Connecting,
        });
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_off_all() {
        let bus = EventBus::new();
        bus.on(EventKind::ApModeStarted, |_| {});
        bus.on(EventKind::ApModeStarted, |_| {});
        assert_eq!(bus.listener_count(EventKind::ApModeStarted), 2);
        assert_eq!(bus.off_all(EventKind::ApModeStarted), 2);
        assert_eq!(bus.listener_count(EventKind::ApModeStarted), 0);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let before = make("before");
        let after = make("after");
        bus.on(EventKind::ConnectionFailed, move |e| before(e));
        bus.on(EventKind::ConnectionFailed, |_| panic!("subscriber bug"));
        bus.on(EventKind::ConnectionFailed, move |e| after(e));

        bus.emit(&Event::ConnectionFailed { retry_count: 5 });
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);

        // Bus remains usable
        bus.emit(&Event::ConnectionFailed { retry_count: 5 });
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_callback_may_unsubscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let bus_clone = bus.clone();
        let calls_clone = calls.clone();
        let slot_clone = slot.clone();
        let id = bus.on(EventKind::Disconnected, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot_clone.lock().unwrap() {
                bus_clone.off(EventKind::Disconnected, id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(&Event::Disconnected);
        bus.emit(&Event::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_kind_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_str(kind.name()).unwrap(), kind);
        }
        let err = EventKind::from_str("reboot").unwrap_err();
        assert!(err.to_string().contains("unknown event: reboot"));
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            Event::ApModeStarted {
                ssid: "Setup".into()
            }
            .kind(),
            EventKind::ApModeStarted
        );
        assert_eq!(
            Event::ConnectionFailed { retry_count: 1 }.kind(),
            EventKind::ConnectionFailed
        );
    }
}
