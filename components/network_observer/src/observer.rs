//! Network observer façade

use crate::activity::SharedRecord;
use crate::block_list::BlockList;
use crate::channel::{ChannelId, HttpChannel, PageContext};
use crate::channel_map::ChannelMap;
use crate::config::{ObserverConfig, ProcessType};
use crate::notification::{
    Notification, NotificationCenter, NotificationObserver, SubscriptionId, Topic,
};
use crate::owner::{IgnoreChannelFn, NetworkEventOwner, OnNetworkEventFn};
use crate::throttle::{ThrottleData, ThrottleManager};
use har_types::{NetworkEvent, ObserverError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Topics observed in the parent process
const PARENT_TOPICS: [Topic; 5] = [
    Topic::Activity,
    Topic::ExamineResponse,
    Topic::ExamineCachedResponse,
    Topic::ModifyRequest,
    Topic::StopRequest,
];

/// Topics observed in a content process
const CONTENT_TOPICS: [Topic; 1] = [Topic::FailedOpeningRequest];

/// Request filter for [`NetworkObserver::block_request`]
///
/// Only URL patterns are supported; a filter without a URL is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFilter {
    pub url: Option<String>,
}

impl BlockFilter {
    pub fn url(pattern: impl Into<String>) -> Self {
        Self {
            url: Some(pattern.into()),
        }
    }
}

/// State shared by the façade, the router and deferred throttle callbacks
pub(crate) struct ObserverInner {
    pub(crate) config: RwLock<ObserverConfig>,
    pub(crate) ignore_channel: IgnoreChannelFn,
    pub(crate) on_network_event: OnNetworkEventFn,
    pub(crate) page: Option<Arc<dyn PageContext>>,
    pub(crate) records: ChannelMap,
    pub(crate) blocked_urls: RwLock<BlockList>,
    /// Channels whose response a service worker synthesized
    pub(crate) intercepted: Mutex<HashSet<ChannelId>>,
    throttle_data: RwLock<Option<ThrottleData>>,
    throttler: Mutex<Option<Arc<ThrottleManager>>>,
    destroyed: AtomicBool,
    sequence: AtomicU64,
    pub(crate) this: Weak<ObserverInner>,
}

impl ObserverInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Throttle manager for the current profile, created on first use
    pub(crate) fn throttler(&self) -> Option<Arc<ThrottleManager>> {
        let data = (*self.throttle_data.read())?;
        let mut throttler = self.throttler.lock();
        Some(
            throttler
                .get_or_insert_with(|| Arc::new(ThrottleManager::new(&data)))
                .clone(),
        )
    }

    pub(crate) fn invoke_on_network_event(
        &self,
        event: &NetworkEvent,
        channel: &Arc<dyn HttpChannel>,
    ) -> Arc<dyn NetworkEventOwner> {
        (self.on_network_event)(event, channel)
    }
}

/// Builder for [`NetworkObserver`]
#[derive(Default)]
pub struct NetworkObserverBuilder {
    ignore_channel: Option<IgnoreChannelFn>,
    on_network_event: Option<OnNetworkEventFn>,
    config: Option<ObserverConfig>,
    page: Option<Arc<dyn PageContext>>,
}

impl NetworkObserverBuilder {
    /// Predicate selecting channels the observer must not touch
    pub fn ignore_channel<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&dyn HttpChannel) -> bool + Send + Sync + 'static,
    {
        self.ignore_channel = Some(Arc::new(ignore));
        self
    }

    /// Factory for the owner receiving each request's data
    pub fn on_network_event<F>(mut self, on_event: F) -> Self
    where
        F: Fn(&NetworkEvent, &Arc<dyn HttpChannel>) -> Arc<dyn NetworkEventOwner>
            + Send
            + Sync
            + 'static,
    {
        self.on_network_event = Some(Arc::new(on_event));
        self
    }

    pub fn config(mut self, config: ObserverConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn page_context(mut self, page: Arc<dyn PageContext>) -> Self {
        self.page = Some(page);
        self
    }

    /// Create the observer and subscribe it to `center`
    ///
    /// # Errors
    /// [`ObserverError::Configuration`] when a required callback is missing
    pub fn build(self, center: &Arc<NotificationCenter>) -> Result<NetworkObserver, ObserverError> {
        let ignore_channel = self
            .ignore_channel
            .ok_or_else(|| ObserverError::configuration("ignore_channel callback is required"))?;
        let on_network_event = self
            .on_network_event
            .ok_or_else(|| ObserverError::configuration("on_network_event callback is required"))?;
        let config = self.config.unwrap_or_default();
        let process_type = config.process_type();

        let inner = Arc::new_cyclic(|this| ObserverInner {
            config: RwLock::new(config),
            ignore_channel,
            on_network_event,
            page: self.page,
            records: ChannelMap::new(),
            blocked_urls: RwLock::new(BlockList::new()),
            intercepted: Mutex::new(HashSet::new()),
            throttle_data: RwLock::new(None),
            throttler: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            sequence: AtomicU64::new(1),
            this: this.clone(),
        });

        let mut topics: Vec<Topic> = match process_type {
            ProcessType::Parent => PARENT_TOPICS.to_vec(),
            ProcessType::Content => CONTENT_TOPICS.to_vec(),
        };
        // Service worker responses are observed in every process
        topics.push(Topic::ServiceWorkerSynthesizedResponse);

        let weak: Weak<ObserverInner> = Arc::downgrade(&inner);
        let subscription = center.subscribe(&topics, weak);
        info!(
            "Network observer started ({:?} process, {} topics)",
            process_type,
            topics.len()
        );

        Ok(NetworkObserver {
            inner,
            center: Arc::downgrade(center),
            subscription: Mutex::new(Some(subscription)),
        })
    }
}

/// Observes the HTTP traffic published on a [`NotificationCenter`] and
/// reports each request to the consumer's [`NetworkEventOwner`]
pub struct NetworkObserver {
    inner: Arc<ObserverInner>,
    center: Weak<NotificationCenter>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl NetworkObserver {
    pub fn builder() -> NetworkObserverBuilder {
        NetworkObserverBuilder::default()
    }

    /// Create an observer with the default configuration
    pub fn new<I, E>(
        ignore_channel: I,
        on_network_event: E,
        center: &Arc<NotificationCenter>,
    ) -> Result<Self, ObserverError>
    where
        I: Fn(&dyn HttpChannel) -> bool + Send + Sync + 'static,
        E: Fn(&NetworkEvent, &Arc<dyn HttpChannel>) -> Arc<dyn NetworkEventOwner>
            + Send
            + Sync
            + 'static,
    {
        Self::builder()
            .ignore_channel(ignore_channel)
            .on_network_event(on_network_event)
            .build(center)
    }

    /// Deliver a notification directly, bypassing the notification center
    pub fn observe(&self, notification: &Notification) {
        self.inner.observe(notification);
    }

    /// Body capture policy for records created from now on
    pub fn set_save_request_and_response_bodies(&self, save: bool) {
        self.inner
            .config
            .write()
            .set_save_request_and_response_bodies(save);
    }

    pub fn config(&self) -> ObserverConfig {
        self.inner.config.read().clone()
    }

    /// Replace the configuration; applies to work started afterwards
    pub fn update_config(&self, config: ObserverConfig) {
        *self.inner.config.write() = config;
    }

    pub fn throttle_data(&self) -> Option<ThrottleData> {
        *self.inner.throttle_data.read()
    }

    /// Replace the throttling profile; `None` turns throttling off
    ///
    /// The current throttle manager is dropped and a new one is created the
    /// next time a channel needs it.
    pub fn set_throttle_data(&self, data: Option<ThrottleData>) {
        *self.inner.throttle_data.write() = data;
        *self.inner.throttler.lock() = None;
        debug!("Throttle profile set to {:?}", data);
    }

    /// Replace the blocked URL patterns
    pub fn set_blocked_urls<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.blocked_urls.write().set_rules(urls);
    }

    pub fn block_request(&self, filter: &BlockFilter) {
        if let Some(url) = &filter.url {
            self.inner.blocked_urls.write().add(url.clone());
        }
    }

    pub fn unblock_request(&self, filter: &BlockFilter) {
        if let Some(url) = &filter.url {
            self.inner.blocked_urls.write().remove(url);
        }
    }

    pub fn blocked_urls(&self) -> Vec<String> {
        self.inner.blocked_urls.read().patterns()
    }

    /// Forget every tracked request; observation continues
    pub fn clear(&self) {
        self.inner.records.clear();
    }

    /// Drop records idle for longer than the configured TTL
    pub fn evict_expired(&self) -> usize {
        let ttl = self.inner.config.read().completed_record_ttl();
        self.inner.records.evict_idle(ttl)
    }

    pub fn tracked_channels(&self) -> usize {
        self.inner.records.len()
    }

    pub fn activity_record(&self, channel_id: ChannelId) -> Option<SharedRecord> {
        self.inner.records.get(channel_id)
    }

    /// Stop observing; every later notification is ignored
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(id) = self.subscription.lock().take() {
            if let Some(center) = self.center.upgrade() {
                center.unsubscribe(id);
            }
        }

        *self.inner.throttler.lock() = None;
        self.inner.intercepted.lock().clear();
        self.inner.records.clear();
        info!("Network observer destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        self.destroy();
    }
}
