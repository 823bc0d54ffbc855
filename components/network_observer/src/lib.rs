//! HTTP network activity observer
//!
//! Subscribes to the lifecycle notifications a transport engine publishes on a
//! [`NotificationCenter`] and reconstructs, for every HTTP(S) request, the data
//! of one HAR entry: headers, cookies, bodies, blocking and cache metadata and
//! the `blocked/dns/connect/ssl/send/wait/receive` timing breakdown.
//!
//! # Features
//! - **Block list**: wildcard URL patterns cancel matching requests before
//!   they are sent
//! - **Throttling**: latency and bandwidth simulation for downloads, upload
//!   limits handed to the channel
//! - **Body capture**: request post data and response bodies, capped by
//!   configurable limits
//!
//! # Example
//!
//! ```
//! use network_observer::{NetworkEventOwner, NetworkObserver, NotificationCenter};
//! use std::sync::Arc;
//! # use network_observer::har_types::*;
//! # struct Sink;
//! # impl NetworkEventOwner for Sink {
//! #     fn add_request_headers(&self, _: Vec<Header>, _: Option<&str>) {}
//! #     fn add_request_cookies(&self, _: Vec<Cookie>) {}
//! #     fn add_request_post_data(&self, _: PostData) {}
//! #     fn add_response_start(&self, _: ResponseStart, _: &str) {}
//! #     fn add_response_headers(&self, _: Vec<Header>) {}
//! #     fn add_response_cookies(&self, _: Vec<Cookie>) {}
//! #     fn add_server_timings(&self, _: Option<Vec<ServerTiming>>) {}
//! #     fn add_event_timings(&self, _: i64, _: HarTimings, _: HarOffsets, _: Option<Vec<ServerTiming>>) {}
//! # }
//!
//! let center = NotificationCenter::new();
//! let observer = NetworkObserver::new(
//!     |_channel| false,
//!     |_event, _channel| Arc::new(Sink) as Arc<dyn NetworkEventOwner>,
//!     &center,
//! )?;
//! observer.set_blocked_urls(["*tracker*"]);
//! # Ok::<(), ObserverError>(())
//! ```

pub mod activity;
pub mod block_list;
mod builder;
pub mod channel;
pub mod channel_map;
pub mod config;
pub mod cookies;
pub mod notification;
pub mod observer;
pub mod owner;
pub mod response_listener;
mod router;
pub mod throttle;
pub mod timings;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use har_types;

pub use activity::{ActivityEvent, ActivityRecord, ActivitySubtype, ActivityType, SentBody};
pub use block_list::BlockList;
pub use builder::DEVTOOLS_BLOCKED_REASON;
pub use channel::{
    BlockedReason, CancelReason, ChannelId, ChannelStatus, HttpChannel, PageContext,
    StreamListener, TimedChannelInfo, UploadThrottle,
};
pub use channel_map::ChannelMap;
pub use config::{ObserverConfig, ObserverConfigBuilder, ProcessType};
pub use har_types::{ChannelError, HarTimingResult, ObserverError};
pub use notification::{Notification, NotificationCenter, NotificationObserver, Topic};
pub use observer::{BlockFilter, NetworkObserver, NetworkObserverBuilder};
pub use owner::NetworkEventOwner;
pub use throttle::{ThrottleData, ThrottleManager};

/// Result type for observer operations
pub type Result<T> = std::result::Result<T, ObserverError>;
