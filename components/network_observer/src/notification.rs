//! In-process notification center
//!
//! The transport engine publishes typed [`Notification`]s; observers
//! subscribe to the [`Topic`]s they care about.

use crate::activity::ActivityEvent;
use crate::channel::HttpChannel;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Notification topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ModifyRequest,
    ExamineResponse,
    ExamineCachedResponse,
    FailedOpeningRequest,
    StopRequest,
    ServiceWorkerSynthesizedResponse,
    /// Socket and transaction activity stream
    Activity,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ModifyRequest => "http-on-modify-request",
            Topic::ExamineResponse => "http-on-examine-response",
            Topic::ExamineCachedResponse => "http-on-examine-cached-response",
            Topic::FailedOpeningRequest => "http-on-failed-opening-request",
            Topic::StopRequest => "http-on-stop-request",
            Topic::ServiceWorkerSynthesizedResponse => "service-worker-synthesized-response",
            Topic::Activity => "http-activity",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle notification
#[derive(Clone)]
pub enum Notification {
    /// Request about to be sent
    ModifyRequest(Arc<dyn HttpChannel>),
    /// Response headers received from the network
    ExamineResponse(Arc<dyn HttpChannel>),
    /// Response headers served from cache
    ExamineCachedResponse(Arc<dyn HttpChannel>),
    /// Opening the channel failed synchronously
    FailedOpeningRequest(Arc<dyn HttpChannel>),
    /// Terminal notification of a channel
    StopRequest(Arc<dyn HttpChannel>),
    /// Response synthesized by a service worker
    ServiceWorkerSynthesizedResponse(Arc<dyn HttpChannel>),
    Activity(ActivityEvent),
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::ModifyRequest(_) => Topic::ModifyRequest,
            Notification::ExamineResponse(_) => Topic::ExamineResponse,
            Notification::ExamineCachedResponse(_) => Topic::ExamineCachedResponse,
            Notification::FailedOpeningRequest(_) => Topic::FailedOpeningRequest,
            Notification::StopRequest(_) => Topic::StopRequest,
            Notification::ServiceWorkerSynthesizedResponse(_) => {
                Topic::ServiceWorkerSynthesizedResponse
            }
            Notification::Activity(_) => Topic::Activity,
        }
    }

    pub fn channel(&self) -> &Arc<dyn HttpChannel> {
        match self {
            Notification::ModifyRequest(channel)
            | Notification::ExamineResponse(channel)
            | Notification::ExamineCachedResponse(channel)
            | Notification::FailedOpeningRequest(channel)
            | Notification::StopRequest(channel)
            | Notification::ServiceWorkerSynthesizedResponse(channel) => channel,
            Notification::Activity(event) => &event.channel,
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Activity(event) => f.debug_tuple("Activity").field(event).finish(),
            other => f
                .debug_struct("Notification")
                .field("topic", &other.topic())
                .field("channel_id", &other.channel().channel_id())
                .finish(),
        }
    }
}

/// Receiver of notifications
pub trait NotificationObserver: Send + Sync {
    fn observe(&self, notification: &Notification);
}

/// Handle returned by [`NotificationCenter::subscribe`]
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    topics: Vec<Topic>,
    observer: Weak<dyn NotificationObserver>,
}

/// Topic based publish/subscribe hub
///
/// Subscribers are held weakly; a dropped observer simply stops receiving.
#[derive(Default)]
pub struct NotificationCenter {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl NotificationCenter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        &self,
        topics: &[Topic],
        observer: Weak<dyn NotificationObserver>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|subscription| subscription.observer.strong_count() > 0);
        subscriptions.push(Subscription {
            id,
            topics: topics.to_vec(),
            observer,
        });
        debug!("Subscription {} registered for {:?}", id, topics);
        id
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        before != subscriptions.len()
    }

    /// Deliver a notification to every live subscriber of its topic
    pub fn publish(&self, notification: Notification) {
        let topic = notification.topic();
        let observers: Vec<Arc<dyn NotificationObserver>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| subscription.topics.contains(&topic))
            .filter_map(|subscription| subscription.observer.upgrade())
            .collect();

        for observer in observers {
            observer.observe(&notification);
        }
    }

    /// Live subscribers of `topic`
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.topics.contains(&topic) && s.observer.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<Topic>>,
    }

    impl NotificationObserver for Collector {
        fn observe(&self, notification: &Notification) {
            self.seen.lock().push(notification.topic());
        }
    }

    fn subscribe(center: &NotificationCenter, collector: &Arc<Collector>, topics: &[Topic]) -> u64 {
        let weak: Weak<Collector> = Arc::downgrade(collector);
        center.subscribe(topics, weak)
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::StopRequest.to_string(), "http-on-stop-request");
        assert_eq!(
            Topic::ServiceWorkerSynthesizedResponse.as_str(),
            "service-worker-synthesized-response"
        );
    }

    #[test]
    fn test_publish_by_topic() {
        let center = NotificationCenter::new();
        let collector = Arc::new(Collector::default());
        subscribe(&center, &collector, &[Topic::StopRequest]);

        let channel = MockChannel::get(1, "https://example.com/");
        center.publish(Notification::ModifyRequest(channel.clone()));
        center.publish(Notification::StopRequest(channel));

        assert_eq!(*collector.seen.lock(), vec![Topic::StopRequest]);
    }

    #[test]
    fn test_unsubscribe() {
        let center = NotificationCenter::new();
        let collector = Arc::new(Collector::default());
        let id = subscribe(&center, &collector, &[Topic::StopRequest]);
        assert_eq!(center.subscriber_count(Topic::StopRequest), 1);

        assert!(center.unsubscribe(id));
        assert!(!center.unsubscribe(id));
        center.publish(Notification::StopRequest(MockChannel::get(1, "https://example.com/")));
        assert!(collector.seen.lock().is_empty());
    }

    #[test]
    fn test_dropped_observer_not_counted() {
        let center = NotificationCenter::new();
        let collector = Arc::new(Collector::default());
        subscribe(&center, &collector, &[Topic::Activity]);
        drop(collector);

        assert_eq!(center.subscriber_count(Topic::Activity), 0);
    }
}
