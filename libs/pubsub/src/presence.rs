//! Presence tracking for connected sessions.
//!
//! Every online client, gateway and relay is tracked under a topic with a key
//! and a meta value. Joins and leaves fan out to subscribers of the topic so
//! that interested sessions can react to peers appearing and disappearing.

use crate::{Bus, Subscription};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::Hash;

/// A join or leave observed on a presence topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent<K, M> {
    Join { key: K, meta: M },
    Leave { key: K, meta: M },
}

/// The moment a session came online.
pub type OnlineAt = DateTime<Utc>;

/// The presence registry, one of the three process singletons.
///
/// A key is tracked at most once per topic; re-tracking replaces the meta
/// (the newer session wins, the older one is announced as a leave first).
/// Leases die with their session: session teardown untracks every topic the
/// session joined.
pub struct Presence<K, M> {
    topics: DashMap<String, HashMap<K, (OnlineAt, M)>>,
    events: Bus<PresenceEvent<K, M>>,
}

impl<K, M> Default for Presence<K, M> {
    fn default() -> Self {
        Self {
            topics: DashMap::default(),
            events: Bus::default(),
        }
    }
}

impl<K, M> Presence<K, M>
where
    K: Clone + Eq + Hash + Send + 'static,
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as online under `topic`.
    pub fn track(&self, topic: &str, key: K, meta: M) {
        let replaced = self
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(key.clone(), (Utc::now(), meta.clone()));

        if let Some((_, old_meta)) = replaced {
            self.events.publish(
                topic,
                PresenceEvent::Leave {
                    key: key.clone(),
                    meta: old_meta,
                },
            );
        }

        self.events.publish(topic, PresenceEvent::Join { key, meta });
    }

    /// Marks `key` as offline under `topic`. Idempotent.
    pub fn untrack(&self, topic: &str, key: &K) {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return;
        };

        let Some((_, meta)) = entry.remove(key) else {
            return;
        };

        drop(entry);

        self.events.publish(
            topic,
            PresenceEvent::Leave {
                key: key.clone(),
                meta,
            },
        );
    }

    /// Everything currently online under `topic`.
    pub fn list(&self, topic: &str) -> Vec<(K, OnlineAt, M)> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .iter()
                    .map(|(key, (online_at, meta))| (key.clone(), *online_at, meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, topic: &str, key: &K) -> Option<M> {
        self.topics
            .get(topic)?
            .get(key)
            .map(|(_, meta)| meta.clone())
    }

    pub fn subscribe(&self, topic: &str) -> Subscription<PresenceEvent<K, M>> {
        self.events.subscribe(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn join_is_observable_by_prior_subscriber() {
        let presence = Presence::<u32, &'static str>::new();
        let mut events = presence.subscribe("gateways:acme");

        presence.track("gateways:acme", 1, "meta");

        assert_eq!(
            events.next().await,
            Some(PresenceEvent::Join {
                key: 1,
                meta: "meta"
            })
        );
    }

    #[tokio::test]
    async fn untrack_emits_leave_with_last_meta() {
        let presence = Presence::<u32, &'static str>::new();
        let mut events = presence.subscribe("relays");

        presence.track("relays", 7, "eu-west");
        presence.untrack("relays", &7);

        assert_eq!(
            events.next().await,
            Some(PresenceEvent::Join {
                key: 7,
                meta: "eu-west"
            })
        );
        assert_eq!(
            events.next().await,
            Some(PresenceEvent::Leave {
                key: 7,
                meta: "eu-west"
            })
        );
        assert!(presence.list("relays").is_empty());
    }

    #[tokio::test]
    async fn untrack_of_unknown_key_is_silent() {
        let presence = Presence::<u32, &'static str>::new();
        let mut events = presence.subscribe("relays");

        presence.untrack("relays", &42);
        presence.track("relays", 1, "only");

        assert!(matches!(
            events.next().await,
            Some(PresenceEvent::Join { key: 1, .. })
        ));
    }

    #[tokio::test]
    async fn retrack_replaces_meta_and_announces_leave_first() {
        let presence = Presence::<u32, &'static str>::new();
        let mut events = presence.subscribe("clients:acme");

        presence.track("clients:acme", 1, "first");
        presence.track("clients:acme", 1, "second");

        assert!(matches!(
            events.next().await,
            Some(PresenceEvent::Join { meta: "first", .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(PresenceEvent::Leave { meta: "first", .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(PresenceEvent::Join {
                meta: "second",
                ..
            })
        ));
        assert_eq!(presence.get("clients:acme", &1), Some("second"));
    }
}
