//! Configuration for the network observer

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap applied to captured request bodies, in characters
pub const DEFAULT_REQUEST_BODY_LIMIT: usize = 1024 * 1024;

/// Default cap applied to captured response bodies (10 MiB)
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Default capacity of the response capture pipe (32 KiB)
pub const DEFAULT_RESPONSE_PIPE_SEGMENT_SIZE: usize = 32 * 1024;

/// Which process the observer runs in.
///
/// The parent process sees the full transaction lifecycle; content processes
/// only see synchronous open failures and service-worker responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    #[default]
    Parent,
    Content,
}

/// Configuration for a [`NetworkObserver`](crate::NetworkObserver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Initial body capture policy
    save_request_and_response_bodies: bool,

    /// Maximum request body length in characters handed to the owner (0 = unlimited)
    request_body_limit: usize,

    /// Maximum response body length captured
    response_body_limit: usize,

    /// Capacity of the bounded tee pipe in bytes
    response_pipe_segment_size: usize,

    /// Process the observer is hosted in
    process_type: ProcessType,

    /// Channel map size that triggers an eviction sweep
    max_tracked_channels: usize,

    /// Age after which idle records are evicted
    #[serde(with = "duration_secs")]
    completed_record_ttl: Duration,

    /// Trace every raw platform notification
    log_platform_events: bool,
}

impl ObserverConfig {
    /// Create a new builder for ObserverConfig
    ///
    /// # Example
    ///
    /// ```
    /// use network_observer::ObserverConfig;
    ///
    /// let config = ObserverConfig::builder()
    ///     .request_body_limit(4096)
    ///     .save_request_and_response_bodies(false)
    ///     .build();
    /// assert_eq!(config.request_body_limit(), 4096);
    /// ```
    pub fn builder() -> ObserverConfigBuilder {
        ObserverConfigBuilder::default()
    }

    pub fn save_request_and_response_bodies(&self) -> bool {
        self.save_request_and_response_bodies
    }

    pub fn request_body_limit(&self) -> usize {
        self.request_body_limit
    }

    pub fn response_body_limit(&self) -> usize {
        self.response_body_limit
    }

    pub fn response_pipe_segment_size(&self) -> usize {
        self.response_pipe_segment_size
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    pub fn max_tracked_channels(&self) -> usize {
        self.max_tracked_channels
    }

    pub fn completed_record_ttl(&self) -> Duration {
        self.completed_record_ttl
    }

    pub fn log_platform_events(&self) -> bool {
        self.log_platform_events
    }

    pub(crate) fn set_save_request_and_response_bodies(&mut self, save: bool) {
        self.save_request_and_response_bodies = save;
    }
}

impl Default for ObserverConfig {
    /// Default values:
    /// - save_request_and_response_bodies: true
    /// - request_body_limit: 1 MiB
    /// - response_body_limit: 10 MiB
    /// - response_pipe_segment_size: 32 KiB
    /// - process_type: Parent
    /// - max_tracked_channels: 10000
    /// - completed_record_ttl: 60 s
    /// - log_platform_events: false
    fn default() -> Self {
        Self {
            save_request_and_response_bodies: true,
            request_body_limit: DEFAULT_REQUEST_BODY_LIMIT,
            response_body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
            response_pipe_segment_size: DEFAULT_RESPONSE_PIPE_SEGMENT_SIZE,
            process_type: ProcessType::Parent,
            max_tracked_channels: 10_000,
            completed_record_ttl: Duration::from_secs(60),
            log_platform_events: false,
        }
    }
}

/// Builder for ObserverConfig
///
/// Options left unset fall back to [`ObserverConfig::default`].
#[derive(Debug, Clone, Default)]
pub struct ObserverConfigBuilder {
    save_request_and_response_bodies: Option<bool>,
    request_body_limit: Option<usize>,
    response_body_limit: Option<usize>,
    response_pipe_segment_size: Option<usize>,
    process_type: Option<ProcessType>,
    max_tracked_channels: Option<usize>,
    completed_record_ttl: Option<Duration>,
    log_platform_events: Option<bool>,
}

impl ObserverConfigBuilder {
    pub fn save_request_and_response_bodies(mut self, save: bool) -> Self {
        self.save_request_and_response_bodies = Some(save);
        self
    }

    /// Set the request body cap
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum body length in bytes, 0 disables truncation
    pub fn request_body_limit(mut self, limit: usize) -> Self {
        self.request_body_limit = Some(limit);
        self
    }

    pub fn response_body_limit(mut self, limit: usize) -> Self {
        self.response_body_limit = Some(limit);
        self
    }

    /// Set the response pipe capacity
    ///
    /// A zero size is replaced by the default when building.
    pub fn response_pipe_segment_size(mut self, size: usize) -> Self {
        self.response_pipe_segment_size = Some(size);
        self
    }

    pub fn process_type(mut self, process_type: ProcessType) -> Self {
        self.process_type = Some(process_type);
        self
    }

    pub fn max_tracked_channels(mut self, max: usize) -> Self {
        self.max_tracked_channels = Some(max);
        self
    }

    pub fn completed_record_ttl(mut self, ttl: Duration) -> Self {
        self.completed_record_ttl = Some(ttl);
        self
    }

    pub fn log_platform_events(mut self, enabled: bool) -> Self {
        self.log_platform_events = Some(enabled);
        self
    }

    /// Build the ObserverConfig
    pub fn build(self) -> ObserverConfig {
        let default = ObserverConfig::default();

        let response_pipe_segment_size = self
            .response_pipe_segment_size
            .filter(|size| *size > 0)
            .unwrap_or(default.response_pipe_segment_size);

        ObserverConfig {
            save_request_and_response_bodies: self
                .save_request_and_response_bodies
                .unwrap_or(default.save_request_and_response_bodies),
            request_body_limit: self.request_body_limit.unwrap_or(default.request_body_limit),
            response_body_limit: self
                .response_body_limit
                .unwrap_or(default.response_body_limit),
            response_pipe_segment_size,
            process_type: self.process_type.unwrap_or(default.process_type),
            max_tracked_channels: self
                .max_tracked_channels
                .unwrap_or(default.max_tracked_channels),
            completed_record_ttl: self
                .completed_record_ttl
                .unwrap_or(default.completed_record_ttl),
            log_platform_events: self
                .log_platform_events
                .unwrap_or(default.log_platform_events),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
