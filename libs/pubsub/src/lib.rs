//! The process-wide pub/sub bus and the presence registry built on top of it.
//!
//! Topics are plain strings (`clients:{account}`, `gateways:{account}`,
//! `relays:{account}`, `relays`, ...). Delivery is fan-out to every live
//! subscriber of a topic; a subscription opened before a publish on the same
//! instance is guaranteed to observe it. Convergence across instances is the
//! responsibility of whatever backend replicates the bus; within one process
//! the bus is the source of truth.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod presence;

pub use presence::{Presence, PresenceEvent};

use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Events buffered per subscriber before a slow subscriber starts lagging.
const TOPIC_CAPACITY: usize = 512;

/// A topic-string fan-out bus.
pub struct Bus<T> {
    topics: DashMap<String, broadcast::Sender<T>>,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self {
            topics: DashMap::default(),
        }
    }
}

impl<T> Bus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to all current subscribers of `topic`.
    ///
    /// Returns how many subscribers received it. Publishing to a topic
    /// without subscribers is a no-op and drops the topic entry.
    pub fn publish(&self, topic: &str, event: T) -> usize {
        let Some(sender) = self.topics.get(topic).map(|entry| entry.value().clone()) else {
            return 0;
        };

        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                self.topics
                    .remove_if(topic, |_, sender| sender.receiver_count() == 0);

                0
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let receiver = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        Subscription {
            topic: topic.to_owned(),
            inner: BroadcastStream::new(receiver),
        }
    }
}

/// A live subscription to a single topic.
///
/// Yields events in publish order. If the subscriber lags behind the topic
/// buffer, the skipped events are logged and dropped rather than terminating
/// the stream.
pub struct Subscription<T> {
    topic: String,
    inner: BroadcastStream<T>,
}

impl<T> Subscription<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> Stream for Subscription<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match std::task::ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(event)) => return Poll::Ready(Some(event)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(topic = %self.topic, %skipped, "Subscription lagged; dropping events");
                    continue;
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
