use std::collections::HashSet;
use std::sync::Arc;

use huddle_core::{ConnectionId, ServerEvent};
use parking_lot::Mutex;

/// Delivery capability the tracker uses to reach connections.
///
/// Delivery is fire-and-forget: a `false` return means that one recipient's
/// copy was lost (queue full, socket gone) and must never stop delivery to
/// the others.
pub trait EventSink {
    /// Deliver `event` to a single connection.
    fn send(&self, to: &ConnectionId, event: &ServerEvent) -> bool;

    /// Deliver `event` to every connection in `to`. Returns how many copies
    /// were accepted.
    fn broadcast(&self, to: &[ConnectionId], event: &ServerEvent) -> usize {
        to.iter().filter(|id| self.send(id, event)).count()
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn send(&self, to: &ConnectionId, event: &ServerEvent) -> bool {
        (**self).send(to, event)
    }

    fn broadcast(&self, to: &[ConnectionId], event: &ServerEvent) -> usize {
        (**self).broadcast(to, event)
    }
}

/// In-memory sink that records every delivery in order.
///
/// Clones share the same log, so a test can keep one handle while the
/// tracker (or an actor task) owns another.
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<(ConnectionId, ServerEvent)>>>,
    unreachable: Arc<Mutex<HashSet<ConnectionId>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `id` fail from now on.
    pub fn make_unreachable(&self, id: &ConnectionId) {
        self.unreachable.lock().insert(id.clone());
    }

    /// Events delivered to `id`, oldest first.
    pub fn events_for(&self, id: &ConnectionId) -> Vec<ServerEvent> {
        self.log
            .lock()
            .iter()
            .filter(|(to, _)| to == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Drain the whole log.
    pub fn take(&self) -> Vec<(ConnectionId, ServerEvent)> {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn send(&self, to: &ConnectionId, event: &ServerEvent) -> bool {
        if self.unreachable.lock().contains(to) {
            return false;
        }
        self.log.lock().push((to.clone(), event.clone()));
        true
    }
}
