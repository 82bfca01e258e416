//! Subscription bookkeeping.
//!
//! Tracks which topics are active on the wire, which are queued until the
//! connection is ready, and which consumers depend on each topic. A topic is
//! subscribed on the wire at most once no matter how many consumers reference
//! it, and released only when its last consumer lets go.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use crate::wire::Topic;

/// Identity of a subscribing unit (a UI component, a module).
///
/// Used to ref-count topic ownership so a component can release exactly its
/// own interests on teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Shared identity for callers that do not track their own.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection-scoped subscription state.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    /// topic -> consumers that asked for it
    owners: HashMap<Topic, HashSet<ConsumerId>>,
    /// topics currently subscribed on the wire
    active: HashSet<Topic>,
    /// topics requested while the transport was not open, insertion order
    pending: Vec<Topic>,
    /// topics waiting for the debounce window to close
    batch: Vec<Topic>,
}

impl Ledger {
    /// Record that a consumer depends on a topic. Idempotent.
    pub fn note_interest(&mut self, topic: &Topic, consumer: &ConsumerId) {
        self.owners
            .entry(topic.clone())
            .or_default()
            .insert(consumer.clone());
    }

    /// Queue topics for after the connection opens, deduplicating against
    /// both the queue and anything already active.
    pub fn queue_pending(&mut self, topics: Vec<Topic>) {
        for topic in topics {
            if self.active.contains(&topic) || self.pending.contains(&topic) {
                continue;
            }
            self.pending.push(topic);
        }
    }

    /// Stage topics into the debounce batch, skipping anything already
    /// active or already staged. Returns how many were newly staged.
    pub fn stage(&mut self, topics: Vec<Topic>) -> usize {
        let mut staged = 0;
        for topic in topics {
            if self.active.contains(&topic) || self.batch.contains(&topic) {
                continue;
            }
            self.batch.push(topic);
            staged += 1;
        }
        staged
    }

    /// Drain the debounce batch, dropping topics that went active or lost
    /// all owners while the window was open.
    pub fn take_batch(&mut self) -> Vec<Topic> {
        let batch = std::mem::take(&mut self.batch);
        batch
            .into_iter()
            .filter(|t| !self.active.contains(t) && self.owners.contains_key(t))
            .collect()
    }

    /// Re-check a topic set after an async gap (token fetch): keep only
    /// topics that are still wanted and still not active.
    pub fn revalidate(&self, topics: Vec<Topic>) -> Vec<Topic> {
        topics
            .into_iter()
            .filter(|t| !self.active.contains(t) && self.owners.contains_key(t))
            .collect()
    }

    /// Mark topics as subscribed on the wire.
    pub fn mark_active(&mut self, topics: &[Topic]) {
        for topic in topics {
            self.active.insert(topic.clone());
        }
    }

    /// Remove one consumer's ownership of the given topics. Returns the
    /// topics that were active on the wire and now have no owner left:
    /// exactly the set that needs a wire unsubscribe.
    pub fn release(&mut self, topics: &[Topic], consumer: &ConsumerId) -> Vec<Topic> {
        let mut to_unsubscribe = Vec::new();

        for topic in topics {
            let emptied = match self.owners.get_mut(topic) {
                Some(owners) => {
                    owners.remove(consumer);
                    owners.is_empty()
                }
                None => continue,
            };

            if !emptied {
                continue;
            }

            self.owners.remove(topic);
            self.pending.retain(|t| t != topic);
            self.batch.retain(|t| t != topic);

            if self.active.remove(topic) {
                to_unsubscribe.push(topic.clone());
            }
        }

        to_unsubscribe
    }

    /// Every topic a consumer has registered interest in.
    pub fn topics_owned_by(&self, consumer: &ConsumerId) -> Vec<Topic> {
        self.owners
            .iter()
            .filter(|(_, owners)| owners.contains(consumer))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Take everything queued while offline, to push through the normal
    /// subscribe path once the connection opens.
    pub fn drain_pending(&mut self) -> Vec<Topic> {
        std::mem::take(&mut self.pending)
    }

    /// Forget all connection-scoped state. The server is not assumed to
    /// remember subscriptions across a reconnect, so consumers re-subscribe
    /// from scratch after each successful reconnection.
    pub fn clear(&mut self) {
        self.owners.clear();
        self.active.clear();
        self.pending.clear();
        self.batch.clear();
    }

    #[cfg(test)]
    pub fn is_active(&self, topic: &Topic) -> bool {
        self.active.contains(topic)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::from(s)
    }

    #[test]
    fn test_pending_dedups_against_queue_and_active() {
        let mut ledger = Ledger::default();
        ledger.mark_active(&[topic("a")]);

        ledger.queue_pending(vec![topic("a"), topic("b"), topic("b"), topic("c")]);

        assert_eq!(ledger.drain_pending(), vec![topic("b"), topic("c")]);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_stage_skips_active_and_staged() {
        let mut ledger = Ledger::default();
        let consumer = ConsumerId::anonymous();
        for t in ["a", "b"] {
            ledger.note_interest(&topic(t), &consumer);
        }
        ledger.mark_active(&[topic("a")]);

        assert_eq!(ledger.stage(vec![topic("a"), topic("b")]), 1);
        assert_eq!(ledger.stage(vec![topic("b")]), 0);
        assert_eq!(ledger.take_batch(), vec![topic("b")]);
    }

    #[test]
    fn test_take_batch_revalidates() {
        let mut ledger = Ledger::default();
        let consumer = ConsumerId::from("c1");
        for t in ["a", "b", "c"] {
            ledger.note_interest(&topic(t), &consumer);
        }

        ledger.stage(vec![topic("a"), topic("b"), topic("c")]);

        // "a" went active during the wait, "b" lost its owner
        ledger.mark_active(&[topic("a")]);
        ledger.release(&[topic("b")], &consumer);

        assert_eq!(ledger.take_batch(), vec![topic("c")]);
    }

    #[test]
    fn test_release_is_ref_counted() {
        let mut ledger = Ledger::default();
        let c1 = ConsumerId::from("c1");
        let c2 = ConsumerId::from("c2");
        let t = topic("shared");

        ledger.note_interest(&t, &c1);
        ledger.note_interest(&t, &c2);
        ledger.mark_active(&[t.clone()]);

        assert!(ledger.release(&[t.clone()], &c1).is_empty());
        assert_eq!(ledger.release(&[t.clone()], &c2), vec![t.clone()]);
        assert!(!ledger.is_active(&t));
    }

    #[test]
    fn test_anonymous_release_keeps_other_owners() {
        let mut ledger = Ledger::default();
        let anon = ConsumerId::anonymous();
        let c2 = ConsumerId::from("c2");
        let t = topic("shared");

        ledger.note_interest(&t, &anon);
        ledger.note_interest(&t, &c2);
        ledger.mark_active(&[t.clone()]);

        assert!(ledger.release(&[t.clone()], &anon).is_empty());
        assert!(ledger.is_active(&t));
        assert_eq!(ledger.release(&[t.clone()], &c2), vec![t]);
    }

    #[test]
    fn test_release_inactive_topic_sends_nothing() {
        let mut ledger = Ledger::default();
        let c = ConsumerId::from("c1");
        let t = topic("queued");

        ledger.note_interest(&t, &c);
        ledger.queue_pending(vec![t.clone()]);

        assert!(ledger.release(&[t], &c).is_empty());
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_topics_owned_by() {
        let mut ledger = Ledger::default();
        let c1 = ConsumerId::from("c1");
        let c2 = ConsumerId::from("c2");

        ledger.note_interest(&topic("a"), &c1);
        ledger.note_interest(&topic("b"), &c1);
        ledger.note_interest(&topic("b"), &c2);

        let mut owned = ledger.topics_owned_by(&c1);
        owned.sort();
        assert_eq!(owned, vec![topic("a"), topic("b")]);
        assert_eq!(ledger.topics_owned_by(&c2), vec![topic("b")]);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut ledger = Ledger::default();
        let c = ConsumerId::anonymous();
        ledger.note_interest(&topic("a"), &c);
        ledger.mark_active(&[topic("a")]);
        ledger.queue_pending(vec![topic("b")]);
        ledger.stage(vec![topic("c")]);

        ledger.clear();

        assert!(!ledger.is_active(&topic("a")));
        assert_eq!(ledger.pending_len(), 0);
        assert!(ledger.take_batch().is_empty());
        assert!(ledger.topics_owned_by(&c).is_empty());
    }
}
