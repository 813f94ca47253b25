//! Typed publish/subscribe registry
//!
//! One slot per message type, keyed by `TypeId`. A type must be enabled exactly
//! once before it can be published or subscribed to. Subscribers run inline on the
//! publisher's thread in registration order; [`EventRelay`] subscriptions instead
//! enqueue the message onto a relay worker.

use crate::error::{Result, VoxError};
use crate::runtime::relay::{EventRelay, RelayQueue};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Anything that can travel through a registry
pub trait Message: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Message for T {}

type Subscriber<M> = Arc<dyn Fn(&M) + Send + Sync>;

struct Slot<M: Message> {
    subscribers: Vec<Subscriber<M>>,
}

impl<M: Message> Slot<M> {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

/// Type-erased view of a slot, so registries can copy or forward their whole
/// vocabulary without naming each message type.
trait AnySlot: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn fresh(&self) -> Box<dyn AnySlot>;
    fn type_name(&self) -> &'static str;
    fn subscriber_count(&self) -> usize;
    fn attach_forward(&mut self, downstream: &Arc<EventRegistry>, queue: &RelayQueue);
}

impl<M: Message> AnySlot for Slot<M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn fresh(&self) -> Box<dyn AnySlot> {
        Box::new(Slot::<M>::new())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn attach_forward(&mut self, downstream: &Arc<EventRegistry>, queue: &RelayQueue) {
        let relay = EventRelay::<M>::to_registry(queue, downstream);
        self.subscribers.push(Arc::new(move |message: &M| {
            relay.deliver(message);
        }));
    }
}

/// Registry of message types and their subscribers
#[derive(Default)]
pub struct EventRegistry {
    slots: RwLock<HashMap<TypeId, Box<dyn AnySlot>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `M`
    pub fn enable<M: Message>(&self) -> Result<()> {
        let mut slots = self.slots.write();
        if slots.contains_key(&TypeId::of::<M>()) {
            return Err(VoxError::EventAlreadyEnabled {
                type_name: std::any::type_name::<M>(),
            });
        }
        slots.insert(TypeId::of::<M>(), Box::new(Slot::<M>::new()));
        Ok(())
    }

    /// Check whether `M` has been enabled
    pub fn exists<M: Message>(&self) -> bool {
        self.slots.read().contains_key(&TypeId::of::<M>())
    }

    /// Invoke every subscriber of `M` on the calling thread, in registration order
    ///
    /// The subscriber list is snapshotted first, so handlers may freely subscribe
    /// or publish on this same registry.
    pub fn publish<M: Message>(&self, message: M) -> Result<()> {
        let subscribers = {
            let slots = self.slots.read();
            let slot = slots
                .get(&TypeId::of::<M>())
                .and_then(|slot| slot.as_any().downcast_ref::<Slot<M>>())
                .ok_or(VoxError::EventNotEnabled {
                    type_name: std::any::type_name::<M>(),
                })?;
            slot.subscribers.clone()
        };

        for subscriber in subscribers {
            subscriber(&message);
        }
        Ok(())
    }

    /// Attach an inline handler for `M`
    pub fn subscribe<M, F>(&self, handler: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.with_slot_mut::<M, _>(|slot| slot.subscribers.push(Arc::new(handler)))
    }

    /// Attach a relay for `M`: publishing enqueues onto the relay's worker
    pub fn connect<M: Message>(&self, relay: EventRelay<M>) -> Result<()> {
        self.subscribe::<M, _>(move |message| {
            if !relay.deliver(message) {
                trace!(
                    "Relay closed, dropping {}",
                    std::any::type_name::<M>()
                );
            }
        })
    }

    /// Enable every type `other` has enabled, without copying subscribers
    ///
    /// Types already enabled here are left untouched.
    pub fn make_compatible(&self, other: &EventRegistry) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let fresh: Vec<(TypeId, Box<dyn AnySlot>)> = other
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.fresh()))
            .collect();

        let mut slots = self.slots.write();
        for (id, slot) in fresh {
            slots.entry(id).or_insert(slot);
        }
        Ok(())
    }

    /// Republish `M` from `upstream` on this registry, via `queue`'s worker
    pub fn forward_from<M: Message>(
        self: &Arc<Self>,
        upstream: &EventRegistry,
        queue: &RelayQueue,
    ) -> Result<()> {
        if std::ptr::eq(Arc::as_ptr(self), upstream) {
            return Err(VoxError::EventSelfForward);
        }
        if !self.exists::<M>() {
            self.enable::<M>()?;
        }
        upstream.connect(EventRelay::<M>::to_registry(queue, self))
    }

    /// Republish every type enabled on `upstream` on this registry, via `queue`'s worker
    pub fn forward_all_from(self: &Arc<Self>, upstream: &EventRegistry, queue: &RelayQueue) -> Result<()> {
        if std::ptr::eq(Arc::as_ptr(self), upstream) {
            return Err(VoxError::EventSelfForward);
        }
        self.make_compatible(upstream)?;

        let mut slots = upstream.slots.write();
        for slot in slots.values_mut() {
            trace!("Forwarding {}", slot.type_name());
            slot.attach_forward(self, queue);
        }
        Ok(())
    }

    /// Number of subscribers currently attached for `M`
    pub fn subscriber_count<M: Message>(&self) -> usize {
        self.slots
            .read()
            .get(&TypeId::of::<M>())
            .map(|slot| slot.subscriber_count())
            .unwrap_or(0)
    }

    /// Drop every slot and subscriber
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    fn with_slot_mut<M, R>(&self, f: impl FnOnce(&mut Slot<M>) -> R) -> Result<R>
    where
        M: Message,
    {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(&TypeId::of::<M>())
            .and_then(|slot| slot.as_any_mut().downcast_mut::<Slot<M>>())
            .ok_or(VoxError::EventNotEnabled {
                type_name: std::any::type_name::<M>(),
            })?;
        Ok(f(slot))
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.read();
        let names: Vec<&'static str> = slots.values().map(|slot| slot.type_name()).collect();
        f.debug_struct("EventRegistry").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Clone, Debug, PartialEq)]
    struct Pong;

    #[test]
    fn test_enable_twice_fails() {
        let registry = EventRegistry::new();
        registry.enable::<Ping>().unwrap();
        let err = registry.enable::<Ping>().unwrap_err();
        assert!(matches!(err, VoxError::EventAlreadyEnabled { .. }));
    }

    #[test]
    fn test_publish_unregistered_fails() {
        let registry = EventRegistry::new();
        let err = registry.publish(Ping(1)).unwrap_err();
        assert!(matches!(err, VoxError::EventNotEnabled { .. }));
        assert!(registry.subscribe::<Ping, _>(|_| {}).is_err());
    }

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let registry = EventRegistry::new();
        registry.enable::<Ping>().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            registry
                .subscribe::<Ping, _>(move |ping| seen.lock().push((tag, ping.0)))
                .unwrap();
        }

        registry.publish(Ping(7)).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let registry = Arc::new(EventRegistry::new());
        registry.enable::<Ping>().unwrap();
        registry.enable::<Pong>().unwrap();
        let pongs = Arc::new(Mutex::new(0));

        let inner = Arc::clone(&registry);
        registry
            .subscribe::<Ping, _>(move |_| inner.publish(Pong).unwrap())
            .unwrap();
        let counter = Arc::clone(&pongs);
        registry
            .subscribe::<Pong, _>(move |_| *counter.lock() += 1)
            .unwrap();

        registry.publish(Ping(1)).unwrap();
        assert_eq!(*pongs.lock(), 1);
    }

    #[test]
    fn test_make_compatible_copies_types_not_subscribers() {
        let upstream = EventRegistry::new();
        upstream.enable::<Ping>().unwrap();
        upstream.enable::<Pong>().unwrap();
        upstream.subscribe::<Ping, _>(|_| {}).unwrap();

        let downstream = EventRegistry::new();
        downstream.make_compatible(&upstream).unwrap();

        assert!(downstream.exists::<Ping>());
        assert!(downstream.exists::<Pong>());
        assert_eq!(downstream.subscriber_count::<Ping>(), 0);
        assert_eq!(upstream.subscriber_count::<Ping>(), 1);
    }

    #[test]
    fn test_forward_into_self_is_rejected() {
        let registry = Arc::new(EventRegistry::new());
        registry.enable::<Ping>().unwrap();
        let queue = RelayQueue::detached("test");
        let err = registry.forward_all_from(&registry, &queue).unwrap_err();
        assert!(matches!(err, VoxError::EventSelfForward));
    }

    #[test]
    fn test_clear_removes_everything() {
        let registry = EventRegistry::new();
        registry.enable::<Ping>().unwrap();
        registry.clear();
        assert!(!registry.exists::<Ping>());
    }
}
