//! Event listener registry
//!
//! Maps event names to ordered listener lists. Listener invocation order is
//! registration order, and a listener registered twice runs twice. The table
//! is a [`DashMap`] so registration and dispatch can happen from any task or
//! thread without a big lock around the whole registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

/// Callback invoked with the positional arguments of a dispatched event.
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Identifies one registration, distinct even for the same callback
/// registered twice.
pub type ListenerId = u64;

struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

type ListenerTable = DashMap<String, Vec<Registration>>;

/// Ordered per-event listener lists with persistent and one-shot
/// registration.
pub struct EventRegistry {
    listeners: Arc<ListenerTable>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener that runs on every emission of `event`.
    pub fn on(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        self.register(event.into(), listener, false)
    }

    /// Register a listener that runs on the next emission of `event`, then
    /// is removed.
    pub fn once(&self, event: impl Into<String>, listener: Listener) -> ListenerHandle {
        self.register(event.into(), listener, true)
    }

    fn register(&self, event: String, listener: Listener, once: bool) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(event.clone())
            .or_insert_with(Vec::new)
            .push(Registration { id, listener, once });
        ListenerHandle {
            listeners: Arc::downgrade(&self.listeners),
            event,
            id,
        }
    }

    /// Remove the earliest registration of `listener` for `event`, matched
    /// by callback identity. No-op when no registration matches.
    pub fn remove_listener(&self, event: &str, listener: &Listener) {
        if let Some(mut entry) = self.listeners.get_mut(event) {
            if let Some(pos) = entry
                .iter()
                .position(|r| Arc::ptr_eq(&r.listener, listener))
            {
                entry.remove(pos);
            }
        }
    }

    /// Invoke every listener registered for `event`, in registration order.
    ///
    /// Dispatch works on a snapshot: listeners added or removed by a running
    /// listener take effect from the next emission. One-shot registrations
    /// are retired before their callback runs, so a `once` listener fires at
    /// most once even when emissions race.
    pub fn emit(&self, event: &str, args: &[Value]) {
        for listener in self.snapshot(event) {
            listener(args);
        }
    }

    /// Take the dispatch snapshot for one emission of `event`, retiring
    /// one-shot entries. The shard guard is released before this returns,
    /// so the listeners the caller invokes are free to touch the registry
    /// again without deadlocking.
    pub(crate) fn snapshot(&self, event: &str) -> Vec<Listener> {
        match self.listeners.get_mut(event) {
            Some(mut entry) => {
                let listeners = entry.iter().map(|r| Arc::clone(&r.listener)).collect();
                entry.retain(|r| !r.once);
                listeners
            }
            None => Vec::new(),
        }
    }

    /// Number of live registrations for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entry| entry.len())
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes exactly the registration it came from, even when the same
/// callback is registered several times.
pub struct ListenerHandle {
    listeners: Weak<ListenerTable>,
    event: String,
    id: ListenerId,
}

impl ListenerHandle {
    /// Remove the registration behind this handle. No-op when the listener
    /// already ran as a one-shot or the registry is gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Some(mut entry) = listeners.get_mut(&self.event) {
                if let Some(pos) = entry.iter().position(|r| r.id == self.id) {
                    entry.remove(pos);
                }
            }
        }
    }

    /// Handle tied to no registry, for endpoints that already shut down.
    pub(crate) fn dangling() -> Self {
        Self {
            listeners: Weak::new(),
            event: String::new(),
            id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn listeners_run_in_registration_order_with_args() {
        let registry = EventRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            registry.on(
                "greet",
                Arc::new(move |args: &[Value]| {
                    calls.lock().unwrap().push((tag, args.to_vec()));
                }),
            );
        }

        registry.emit("greet", &[json!("hello"), json!(42)]);

        let calls = calls.lock().unwrap();
        let expected_args = vec![json!("hello"), json!(42)];
        assert_eq!(
            *calls,
            vec![
                ("first", expected_args.clone()),
                ("second", expected_args.clone()),
                ("third", expected_args),
            ]
        );
    }

    #[test]
    fn once_fires_exactly_once() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        registry.once(
            "tick",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..5 {
            registry.emit("tick", &[]);
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count("tick"), 0);
    }

    #[test]
    fn removed_listeners_stop_receiving() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.on("tick", Arc::clone(&listener));
        registry.emit("tick", &[]);
        registry.remove_listener("tick", &listener);
        registry.emit("tick", &[]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_an_absent_listener_is_a_no_op() {
        let registry = EventRegistry::new();
        let listener: Listener = Arc::new(|_| {});
        registry.remove_listener("never-registered", &listener);
        assert_eq!(registry.listener_count("never-registered"), 0);
    }

    #[test]
    fn handle_removes_only_its_own_registration() {
        let registry = EventRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        let handle = registry.on(
            "tick",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&second);
        registry.on(
            "tick",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        handle.unsubscribe();
        registry.emit("tick", &[]);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count("tick"), 1);
    }

    #[test]
    fn emitting_without_listeners_is_fine() {
        let registry = EventRegistry::new();
        registry.emit("nobody-home", &[json!(1)]);
    }

    #[test]
    fn listener_added_during_dispatch_waits_for_next_emission() {
        let registry = Arc::new(EventRegistry::new());
        let late_calls = Arc::new(AtomicUsize::new(0));

        let reg = Arc::clone(&registry);
        let late = Arc::clone(&late_calls);
        registry.on(
            "tick",
            Arc::new(move |_| {
                let late = Arc::clone(&late);
                reg.on(
                    "tick",
                    Arc::new(move |_| {
                        late.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        registry.emit("tick", &[]);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        registry.emit("tick", &[]);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_runs_twice_and_removal_takes_one() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.on("tick", Arc::clone(&listener));
        registry.on("tick", Arc::clone(&listener));
        registry.emit("tick", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        registry.remove_listener("tick", &listener);
        registry.emit("tick", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
