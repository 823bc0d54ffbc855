//! Network activity observer for CortenBrowser
//!
//! Re-exports the observer and the HAR vocabulary it produces so hosts
//! depend on a single crate.
//!
//! # Example
//!
//! ```
//! use netmonitor::{ObserverConfig, ProcessType};
//!
//! let config = ObserverConfig::builder()
//!     .process_type(ProcessType::Content)
//!     .build();
//! assert_eq!(config.process_type(), ProcessType::Content);
//! ```

pub use har_types::{
    ChannelError, Cookie, HarOffsets, HarPhase, HarTimingResult, HarTimings, Header,
    NetworkEvent, ObserverError, PostData, ResponseContent, ResponseStart, ServerTiming,
    NOT_OBSERVED,
};
pub use network_observer::{
    ActivityEvent, ActivitySubtype, ActivityType, BlockFilter, BlockedReason, CancelReason,
    ChannelId, ChannelStatus, HttpChannel, NetworkEventOwner, NetworkObserver,
    NetworkObserverBuilder, Notification, NotificationCenter, ObserverConfig,
    ObserverConfigBuilder, PageContext, ProcessType, Result, StreamListener, ThrottleData,
    TimedChannelInfo, Topic, UploadThrottle,
};
