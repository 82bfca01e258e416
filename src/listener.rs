//! Listener registry: inbound fan-out to registered consumers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::wire::{Envelope, Topic};

/// A consumer callback for inbound messages.
///
/// Invoked on the connection worker task; implementations must be quick and
/// hand heavy work off elsewhere.
pub trait Listener: Send + Sync {
    /// called for every message that passes this listener's filters
    fn on_message(&self, message: Arc<Envelope>);
}

impl<F> Listener for F
where
    F: Fn(Arc<Envelope>) + Send + Sync,
{
    fn on_message(&self, message: Arc<Envelope>) {
        self(message)
    }
}

struct Registration {
    generation: u64,
    types: HashSet<String>,
    topics: Option<HashSet<Topic>>,
    listener: Arc<dyn Listener>,
}

impl Registration {
    fn wants(&self, message: &Envelope) -> bool {
        // system messages are globally relevant, filters do not apply
        if message.is_system() {
            return true;
        }

        if !self.types.contains(&message.kind) {
            return false;
        }

        match (&self.topics, &message.topic) {
            (None, _) | (_, None) => true,
            (Some(topics), Some(topic)) => topics.contains(topic),
        }
    }
}

/// Pure bookkeeping: listener id -> (type filter, topic filter, callback).
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Registration>,
    next_generation: u64,
}

impl Registry {
    /// Register a listener. Re-registering an id replaces the prior record.
    /// Returns the generation tag the matching unregister must carry.
    pub fn register(
        &mut self,
        id: String,
        types: HashSet<String>,
        topics: Option<HashSet<Topic>>,
        listener: Arc<dyn Listener>,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        if self
            .entries
            .insert(
                id.clone(),
                Registration {
                    generation,
                    types,
                    topics,
                    listener,
                },
            )
            .is_some()
        {
            log::debug!("Listener {id} replaced by re-registration");
        }

        generation
    }

    /// Remove a listener, but only if the generation still matches: a stale
    /// guard dropped after a re-registration must not remove the
    /// replacement.
    pub fn unregister(&mut self, id: &str, generation: u64) -> bool {
        match self.entries.get(id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Fan a message out to every listener whose filters accept it.
    /// Returns the delivery count.
    pub fn dispatch(&self, message: &Arc<Envelope>) -> usize {
        let mut delivered = 0;

        for entry in self.entries.values() {
            if entry.wants(message) {
                entry.listener.on_message(Arc::clone(message));
                delivered += 1;
            }
        }

        delivered
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
