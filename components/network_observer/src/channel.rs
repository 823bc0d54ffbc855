//! Platform channel boundary
//!
//! The observer never performs I/O itself. Everything it learns about a
//! request comes through [`HttpChannel`], and the only thing it ever does to
//! a request is cancel it or splice a listener into its response stream.

use har_types::{ChannelError, Header, ServerTiming};
use url::Url;

/// Opaque identity of a platform channel
pub type ChannelId = u64;

/// Completion status of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Success,
    /// Cancelled by a binding (blocked by the observer or the page)
    BindingAborted,
    /// Any other platform failure code
    Failed(u32),
}

impl ChannelStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelStatus::Success)
    }
}

/// Reason passed to [`HttpChannel::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Aborted by binding, not a network error
    BindingAborted,
}

/// Reason the platform blocked a request before it was sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedReason {
    pub reason: String,
    /// Extension responsible for the block, if any
    pub extension: Option<String>,
}

impl BlockedReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            extension: None,
        }
    }
}

/// Timestamps kept by the channel itself (microseconds, 0 when unset)
///
/// Connection events are sometimes attached to a speculative channel rather
/// than the one being observed; the platform glues them back together here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimedChannelInfo {
    pub async_open_time: i64,
    pub domain_lookup_start_time: i64,
    pub domain_lookup_end_time: i64,
    pub connect_start_time: i64,
    pub tcp_connect_end_time: i64,
    pub secure_connection_start_time: i64,
    pub connect_end_time: i64,
}

impl TimedChannelInfo {
    /// Zero every timestamp that predates `async_open_time`.
    ///
    /// Such values belong to an earlier, reused connection and would yield
    /// negative or inflated durations.
    pub fn sanitized(&self) -> Self {
        let clamp = |value: i64| {
            if value != 0 && self.async_open_time != 0 && value < self.async_open_time {
                0
            } else {
                value
            }
        };

        Self {
            async_open_time: self.async_open_time,
            domain_lookup_start_time: clamp(self.domain_lookup_start_time),
            domain_lookup_end_time: clamp(self.domain_lookup_end_time),
            connect_start_time: clamp(self.connect_start_time),
            tcp_connect_end_time: clamp(self.tcp_connect_end_time),
            secure_connection_start_time: clamp(self.secure_connection_start_time),
            connect_end_time: clamp(self.connect_end_time),
        }
    }
}

/// Upload bandwidth limit installed on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadThrottle {
    pub mean_bps: u64,
    pub max_bps: u64,
}

/// Consumer of a channel's response byte stream
pub trait StreamListener: Send {
    fn on_start_request(&mut self) {}

    fn on_data_available(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    fn on_stop_request(&mut self, status: ChannelStatus);
}

/// Wraps a channel's current listener and returns its replacement
pub type ListenerWrapper =
    Box<dyn FnOnce(Box<dyn StreamListener>) -> Box<dyn StreamListener> + Send>;

/// One HTTP(S) request as seen by the transport engine
///
/// Reads that can legitimately fail once the channel has moved past the
/// readable window return `Result`, and callers treat
/// [`ChannelError::NotAvailable`] as a normal state.
pub trait HttpChannel: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    fn url(&self) -> &str;

    fn method(&self) -> &str;

    /// Whether this is an http or https channel
    fn is_http(&self) -> bool {
        Url::parse(self.url())
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Success
    }

    fn blocked_reason(&self) -> Option<BlockedReason> {
        None
    }

    fn cancel(&self, reason: CancelReason) -> Result<(), ChannelError>;

    fn request_headers(&self) -> Result<Vec<Header>, ChannelError>;

    /// Response headers as received from the network, before any rewriting
    fn original_response_headers(&self) -> Result<Vec<Header>, ChannelError>;

    /// `(major, minor)` HTTP version of the response
    fn response_version(&self) -> Option<(u32, u32)> {
        None
    }

    fn response_status(&self) -> Option<u16> {
        None
    }

    fn response_status_text(&self) -> Option<String> {
        None
    }

    /// ALPN negotiated protocol
    fn protocol_version(&self) -> Result<String, ChannelError> {
        Err(ChannelError::Unsupported("protocol_version"))
    }

    fn is_from_cache(&self) -> Result<bool, ChannelError> {
        Ok(false)
    }

    fn remote_address(&self) -> Option<String> {
        None
    }

    fn remote_port(&self) -> Option<u16> {
        None
    }

    fn timed_channel(&self) -> Option<TimedChannelInfo> {
        None
    }

    fn server_timings(&self) -> Option<Vec<ServerTiming>> {
        None
    }

    /// Read the request body from the upload stream
    fn read_post_text(&self, _charset: Option<&str>) -> Option<String> {
        None
    }

    /// Character set of the document that issued the request
    fn document_charset(&self) -> Option<String> {
        None
    }

    fn is_preload(&self) -> bool {
        false
    }

    fn is_xhr(&self) -> bool {
        false
    }

    fn is_private(&self) -> bool {
        false
    }

    /// Splice a new listener in front of the current response listener
    fn set_new_listener(&self, _wrap: ListenerWrapper) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("set_new_listener"))
    }

    fn set_upload_throttle(&self, _throttle: UploadThrottle) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("set_upload_throttle"))
    }
}

/// The page currently loaded in the observed context
pub trait PageContext: Send + Sync {
    fn page_url(&self) -> Option<String>;

    /// Post text cached by the page's own navigation
    fn read_post_text_from_page(&self, charset: Option<&str>) -> Option<String>;
}

/// Host part of a URL, empty when the URL has none
pub(crate) fn hostname_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Scheme of a URL, empty when it cannot be parsed
pub(crate) fn scheme_of(url: &str) -> String {
    Url::parse(url)
        .map(|url| url.scheme().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_drops_stale_times() {
        let info = TimedChannelInfo {
            async_open_time: 1_000,
            connect_start_time: 500,
            tcp_connect_end_time: 1_500,
            ..Default::default()
        };

        let clean = info.sanitized();
        assert_eq!(clean.connect_start_time, 0);
        assert_eq!(clean.tcp_connect_end_time, 1_500);
        assert_eq!(clean.domain_lookup_start_time, 0);
    }

    #[test]
    fn test_sanitized_without_open_time() {
        let info = TimedChannelInfo {
            connect_start_time: 500,
            ..Default::default()
        };
        assert_eq!(info.sanitized().connect_start_time, 500);
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(hostname_of("https://example.com:8443/a?b"), "example.com");
        assert_eq!(hostname_of("not a url"), "");
        assert_eq!(scheme_of("http://example.com/"), "http");
    }
}
