//! Process-wide typed publish/subscribe registry.
//!
//! ```text
//! RunService ── publish(RunCreated) ──► EventBus
//!                                          │ snapshot listeners of kind
//!                          ┌───────────────┼───────────────┐
//!                          ▼               ▼               ▼
//!                     listener A      listener B      listener C
//!                   (connection 1)  (connection 2)  (connection 3)
//! ```
//!
//! Listeners run synchronously on the publishing thread, in subscription
//! order. Each kind keeps an `Arc<Vec<_>>` of listeners that is replaced on
//! every (un)subscribe, so a publish only holds the lock long enough to clone
//! one `Arc`. Listeners may therefore (un)subscribe from inside a publish.
//!
//! A listener that returns an error or panics is logged and skipped; the
//! remaining listeners still see the event and `publish` never fails.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;
use trichter_core::{EventKind, RunEvent};

/// An event that can travel over an [`EventBus`].
///
/// `Kind` is the closed tag listeners subscribe to; the event type itself
/// carries the payload, so the kind/payload pairing is checked at compile
/// time.
pub trait BusEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

impl BusEvent for RunEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        RunEvent::kind(self)
    }
}

/// The bus used by the leaderboard.
pub type RunBus = EventBus<RunEvent>;

/// Failure reported by a listener. Logged by the bus, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("receiver stalled with {capacity} undelivered frames")]
    Stalled { capacity: usize },
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("{0}")]
    Other(String),
}

impl ListenerError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("listener limit of {limit} reached for {kind}")]
    ListenerLimit { kind: String, limit: usize },
}

/// Listener registration limits, per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Above this many listeners a warning is logged; nothing is refused
    pub soft_listener_limit: usize,
    /// Subscriptions are refused once a kind has this many listeners
    pub hard_listener_limit: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            soft_listener_limit: 50,
            hard_listener_limit: Some(10_000),
        }
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub listener_failures: u64,
    pub active_listeners: usize,
}

struct AtomicBusStats {
    events_published: AtomicU64,
    deliveries: AtomicU64,
    listener_failures: AtomicU64,
}

impl AtomicBusStats {
    fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }
}

type Listener<E> = Arc<dyn Fn(&E) -> Result<(), ListenerError> + Send + Sync>;

struct Slot<E> {
    id: u64,
    listener: Listener<E>,
}

impl<E> Clone for Slot<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
        }
    }
}

/// Handle pairing a listener with the kind it was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription<K> {
    kind: K,
    id: u64,
}

impl<K: Copy> Subscription<K> {
    pub fn kind(&self) -> K {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct BusInner<E: BusEvent> {
    config: BusConfig,
    listeners: RwLock<HashMap<E::Kind, Arc<Vec<Slot<E>>>>>,
    next_id: AtomicU64,
    stats: AtomicBusStats,
}

impl<E: BusEvent> BusInner<E> {
    fn remove(&self, subscription: &Subscription<E::Kind>) -> bool {
        let mut listeners = self.listeners.write();
        let Some(current) = listeners.get(&subscription.kind) else {
            return false;
        };
        if !current.iter().any(|slot| slot.id == subscription.id) {
            return false;
        }

        let remaining: Vec<Slot<E>> = current
            .iter()
            .filter(|slot| slot.id != subscription.id)
            .cloned()
            .collect();
        if remaining.is_empty() {
            listeners.remove(&subscription.kind);
        } else {
            listeners.insert(subscription.kind, Arc::new(remaining));
        }
        true
    }
}

/// Typed publish/subscribe registry. Cloning shares the same registry.
pub struct EventBus<E: BusEvent> {
    inner: Arc<BusInner<E>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stats: AtomicBusStats::new(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register `listener` for every future event of `kind`.
    ///
    /// Fails only when the kind already holds `hard_listener_limit`
    /// listeners.
    pub fn subscribe<F>(&self, kind: E::Kind, listener: F) -> Result<Subscription<E::Kind>, BusError>
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let config = &self.inner.config;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let count = {
            let mut listeners = self.inner.listeners.write();
            let current = listeners.get(&kind).map_or(0, |slots| slots.len());

            if let Some(limit) = config.hard_listener_limit {
                if current >= limit {
                    return Err(BusError::ListenerLimit {
                        kind: format!("{kind:?}"),
                        limit,
                    });
                }
            }

            let mut next: Vec<Slot<E>> = Vec::with_capacity(current + 1);
            if let Some(slots) = listeners.get(&kind) {
                next.extend(slots.iter().cloned());
            }
            next.push(Slot {
                id,
                listener: Arc::new(listener),
            });
            let count = next.len();
            listeners.insert(kind, Arc::new(next));
            count
        };

        if count > config.soft_listener_limit {
            log::warn!(
                "{count} listeners registered for {kind:?} (soft limit {}); possible subscription leak",
                config.soft_listener_limit
            );
        }

        Ok(Subscription { kind, id })
    }

    /// Like [`subscribe`](Self::subscribe), but the returned guard
    /// unsubscribes when released or dropped.
    pub fn subscribe_guarded<F>(&self, kind: E::Kind, listener: F) -> Result<SubscriptionGuard<E>, BusError>
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let subscription = self.subscribe(kind, listener)?;
        Ok(SubscriptionGuard {
            bus: Arc::downgrade(&self.inner),
            subscription: Some(subscription),
        })
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription<E::Kind>) -> bool {
        self.inner.remove(subscription)
    }

    /// Deliver `event` to every listener of its kind, in subscription order.
    ///
    /// Returns how many listeners handled the event without error.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot = self.inner.listeners.read().get(&kind).cloned();
        self.inner
            .stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);

        let Some(slots) = snapshot else {
            log::debug!("Published {kind:?} to no listeners");
            return 0;
        };

        let mut delivered = 0;
        for slot in slots.iter() {
            match catch_unwind(AssertUnwindSafe(|| (slot.listener)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.inner
                        .stats
                        .listener_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::error!("Listener {} failed on {kind:?}: {e}", slot.id);
                }
                Err(panic) => {
                    self.inner
                        .stats
                        .listener_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Listener {} panicked on {kind:?}: {}",
                        slot.id,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        self.inner
            .stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        log::debug!("Published {kind:?} to {delivered}/{} listeners", slots.len());
        delivered
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner
            .listeners
            .read()
            .get(&kind)
            .map_or(0, |slots| slots.len())
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.listeners.read().values().map(|s| s.len()).sum()
    }

    pub fn stats(&self) -> BusStats {
        let stats = &self.inner.stats;
        BusStats {
            events_published: stats.events_published.load(Ordering::Relaxed),
            deliveries: stats.deliveries.load(Ordering::Relaxed),
            listener_failures: stats.listener_failures.load(Ordering::Relaxed),
            active_listeners: self.total_listeners(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Owns one subscription and removes it exactly once.
///
/// Holds only a weak reference, so a guard never keeps the bus alive.
pub struct SubscriptionGuard<E: BusEvent> {
    bus: Weak<BusInner<E>>,
    subscription: Option<Subscription<E::Kind>>,
}

impl<E: BusEvent> SubscriptionGuard<E> {
    pub fn subscription(&self) -> Option<&Subscription<E::Kind>> {
        self.subscription.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// Unsubscribe now. Later calls (and the drop) do nothing.
    pub fn release(&mut self) -> bool {
        let Some(subscription) = self.subscription.take() else {
            return false;
        };
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&subscription),
            None => false,
        }
    }
}

impl<E: BusEvent> Drop for SubscriptionGuard<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use trichter_core::{Owner, RunData, RunWithOwner};

    fn run(id: &str, rate: f64) -> RunWithOwner {
        RunWithOwner {
            id: id.into(),
            name: None,
            data: RunData {
                duration: 3.0,
                rate,
                volume: 0.5,
            },
            image: trichter_core::PLACEHOLDER_IMAGE.into(),
            created_at: chrono::Utc::now(),
            user: Some(Owner::new("u1", "Alice", "alice")),
        }
    }

    fn recorder(bus: &RunBus, kind: EventKind) -> (Subscription<EventKind>, Arc<Mutex<Vec<RunEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus
            .subscribe(kind, move |event: &RunEvent| {
                sink.lock().push(event.clone());
                Ok(())
            })
            .unwrap();
        (sub, seen)
    }

    #[test]
    fn test_publish_reaches_listener_in_order() {
        let bus = RunBus::default();
        let (_sub, seen) = recorder(&bus, EventKind::RunCreated);

        let events: Vec<RunEvent> = (0..5)
            .map(|i| RunEvent::Created(run(&format!("r{i}"), i as f64 + 1.0)))
            .collect();
        for event in &events {
            assert_eq!(bus.publish(event), 1);
        }

        assert_eq!(*seen.lock(), events);
    }

    #[test]
    fn test_listeners_only_see_their_kind() {
        let bus = RunBus::default();
        let (_a, created) = recorder(&bus, EventKind::RunCreated);
        let (_b, deleted) = recorder(&bus, EventKind::RunDeleted);

        bus.publish(&RunEvent::deleted("r1"));

        assert!(created.lock().is_empty());
        assert_eq!(deleted.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery_and_is_idempotent() {
        let bus = RunBus::default();
        let (sub, seen) = recorder(&bus, EventKind::RunCreated);

        bus.publish(&RunEvent::Created(run("r1", 1.0)));
        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        bus.publish(&RunEvent::Created(run("r2", 1.0)));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(bus.listener_count(EventKind::RunCreated), 0);
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let bus = RunBus::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        bus.subscribe(EventKind::RunCreated, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ListenerError::other("boom"))
            } else {
                Ok(())
            }
        })
        .unwrap();
        let (_sub, seen) = recorder(&bus, EventKind::RunCreated);

        assert_eq!(bus.publish(&RunEvent::Created(run("r1", 1.0))), 1);
        assert_eq!(bus.publish(&RunEvent::Created(run("r2", 1.0))), 2);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bus.stats().listener_failures, 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = RunBus::default();
        bus.subscribe(EventKind::RunUpdated, |_| panic!("listener bug"))
            .unwrap();
        let (_sub, seen) = recorder(&bus, EventKind::RunUpdated);

        let delivered = bus.publish(&RunEvent::Updated(run("r1", 1.0)));
        bus.publish(&RunEvent::Updated(run("r1", 2.0)));

        assert_eq!(delivered, 1);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bus.stats().listener_failures, 2);
    }

    #[test]
    fn test_guard_releases_exactly_once() {
        let bus = RunBus::default();
        let mut guard = bus
            .subscribe_guarded(EventKind::RunDeleted, |_| Ok(()))
            .unwrap();
        assert_eq!(bus.listener_count(EventKind::RunDeleted), 1);

        assert!(guard.release());
        assert!(!guard.release());
        assert!(!guard.is_active());
        drop(guard);
        assert_eq!(bus.listener_count(EventKind::RunDeleted), 0);
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let bus = RunBus::default();
        {
            let _guard = bus
                .subscribe_guarded(EventKind::RunCreated, |_| Ok(()))
                .unwrap();
            assert_eq!(bus.total_listeners(), 1);
        }
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_guard_outliving_bus_is_harmless() {
        let bus = RunBus::default();
        let mut guard = bus
            .subscribe_guarded(EventKind::RunCreated, |_| Ok(()))
            .unwrap();
        drop(bus);
        assert!(!guard.release());
    }

    #[test]
    fn test_soft_limit_never_refuses() {
        let bus = RunBus::new(BusConfig {
            soft_listener_limit: 2,
            hard_listener_limit: None,
        });
        let subs: Vec<_> = (0..10)
            .map(|_| bus.subscribe(EventKind::RunCreated, |_| Ok(())).unwrap())
            .collect();
        assert_eq!(subs.len(), 10);
        assert_eq!(bus.publish(&RunEvent::Created(run("r1", 1.0))), 10);
    }

    #[test]
    fn test_hard_limit_rejects() {
        let bus = RunBus::new(BusConfig {
            soft_listener_limit: 1,
            hard_listener_limit: Some(2),
        });
        bus.subscribe(EventKind::RunCreated, |_| Ok(())).unwrap();
        bus.subscribe(EventKind::RunCreated, |_| Ok(())).unwrap();
        let err = bus.subscribe(EventKind::RunCreated, |_| Ok(())).unwrap_err();
        assert_eq!(
            err,
            BusError::ListenerLimit {
                kind: "RunCreated".into(),
                limit: 2
            }
        );
        // Other kinds have their own budget.
        assert!(bus.subscribe(EventKind::RunDeleted, |_| Ok(())).is_ok());
    }

    #[test]
    fn test_subscribe_during_publish_does_not_deadlock() {
        let bus = RunBus::default();
        let inner_bus = bus.clone();
        let late = Arc::new(AtomicU64::new(0));
        let late_counter = late.clone();
        bus.subscribe(EventKind::RunCreated, move |_| {
            let c = late_counter.clone();
            inner_bus
                .subscribe(EventKind::RunCreated, move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .map(|_| ())
                .map_err(|e| ListenerError::other(e.to_string()))
        })
        .unwrap();

        assert_eq!(bus.publish(&RunEvent::Created(run("r1", 1.0))), 1);
        // The listener added during the first publish missed it.
        assert_eq!(late.load(Ordering::SeqCst), 0);
        bus.publish(&RunEvent::Created(run("r2", 1.0)));
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_self_during_publish() {
        let bus = RunBus::default();
        let slot: Arc<Mutex<Option<SubscriptionGuard<RunEvent>>>> = Arc::new(Mutex::new(None));
        let slot_in = slot.clone();
        let guard = bus
            .subscribe_guarded(EventKind::RunDeleted, move |_| {
                if let Some(mut g) = slot_in.lock().take() {
                    g.release();
                }
                Ok(())
            })
            .unwrap();
        *slot.lock() = Some(guard);

        assert_eq!(bus.publish(&RunEvent::deleted("r1")), 1);
        assert_eq!(bus.publish(&RunEvent::deleted("r2")), 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let bus = RunBus::default();
        let (_a, _) = recorder(&bus, EventKind::RunCreated);
        let (_b, _) = recorder(&bus, EventKind::RunCreated);
        bus.publish(&RunEvent::Created(run("r1", 1.0)));
        bus.publish(&RunEvent::deleted("r1"));

        let stats = bus.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.active_listeners, 2);
    }
}
