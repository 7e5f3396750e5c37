//! Typed event queues.
//!
//! The session publishes lifecycle events (connects, joins, leaves, vote
//! outcomes) here; observers on the tick task drain them by type. Each event
//! type gets its own FIFO queue keyed by `TypeId`.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    fn queue_mut<E: 'static + Send + Sync>(&mut self) -> &mut Vec<E> {
        let slot = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        // Queues are only ever inserted under their own TypeId.
        match slot.downcast_mut::<Vec<E>>() {
            Some(queue) => queue,
            None => unreachable!("event queue keyed by foreign TypeId"),
        }
    }

    /// Pushes an event into its queue.
    pub fn publish<E: 'static + Send + Sync>(&mut self, e: E) {
        self.queue_mut::<E>().push(e);
    }

    /// Number of pending events of a type.
    pub fn pending<E: 'static + Send + Sync>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<E>())
            .and_then(|q| q.downcast_ref::<Vec<E>>())
            .map_or(0, Vec::len)
    }

    /// Drains all queued events of a type, oldest first.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }
}
