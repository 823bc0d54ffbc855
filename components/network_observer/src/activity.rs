//! Activity records and the raw lifecycle events that feed them

use crate::channel::{hostname_of, ChannelId, HttpChannel};
use crate::owner::NetworkEventOwner;
use crate::throttle::ThrottleListener;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Shared handle to an activity record
pub type SharedRecord = Arc<Mutex<ActivityRecord>>;

/// Wall-clock time in microseconds since the epoch
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Kind of low-level activity notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    SocketTransport,
    HttpTransaction,
    Other(u32),
}

impl ActivityType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0001 => ActivityType::SocketTransport,
            0x0002 => ActivityType::HttpTransaction,
            other => ActivityType::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ActivityType::SocketTransport => 0x0001,
            ActivityType::HttpTransaction => 0x0002,
            ActivityType::Other(code) => *code,
        }
    }
}

/// Lifecycle phase reported by an activity notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySubtype {
    RequestHeader,
    RequestBodySent,
    ResponseStart,
    ResponseHeader,
    ResponseComplete,
    TransactionClose,
    StatusResolving,
    StatusResolved,
    StatusConnectingTo,
    StatusConnectedTo,
    StatusSendingTo,
    StatusWaitingFor,
    StatusReceivingFrom,
    StatusTlsStarting,
    StatusTlsEnding,
    Other(u32),
}

impl ActivitySubtype {
    /// Subtypes whose delivery is held back while download throttling is active
    pub const DOWNLOAD: [ActivitySubtype; 4] = [
        ActivitySubtype::ResponseStart,
        ActivitySubtype::ResponseHeader,
        ActivitySubtype::ResponseComplete,
        ActivitySubtype::TransactionClose,
    ];

    pub fn from_code(code: u32) -> Self {
        match code {
            0x5001 => ActivitySubtype::RequestHeader,
            0x5002 => ActivitySubtype::RequestBodySent,
            0x5003 => ActivitySubtype::ResponseStart,
            0x5004 => ActivitySubtype::ResponseHeader,
            0x5005 => ActivitySubtype::ResponseComplete,
            0x5006 => ActivitySubtype::TransactionClose,
            0x804b_0003 => ActivitySubtype::StatusResolving,
            0x804b_000b => ActivitySubtype::StatusResolved,
            0x804b_0007 => ActivitySubtype::StatusConnectingTo,
            0x804b_0004 => ActivitySubtype::StatusConnectedTo,
            0x804b_0005 => ActivitySubtype::StatusSendingTo,
            0x804b_000a => ActivitySubtype::StatusWaitingFor,
            0x804b_0006 => ActivitySubtype::StatusReceivingFrom,
            0x804b_000c => ActivitySubtype::StatusTlsStarting,
            0x804b_000d => ActivitySubtype::StatusTlsEnding,
            other => ActivitySubtype::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ActivitySubtype::RequestHeader => 0x5001,
            ActivitySubtype::RequestBodySent => 0x5002,
            ActivitySubtype::ResponseStart => 0x5003,
            ActivitySubtype::ResponseHeader => 0x5004,
            ActivitySubtype::ResponseComplete => 0x5005,
            ActivitySubtype::TransactionClose => 0x5006,
            ActivitySubtype::StatusResolving => 0x804b_0003,
            ActivitySubtype::StatusResolved => 0x804b_000b,
            ActivitySubtype::StatusConnectingTo => 0x804b_0007,
            ActivitySubtype::StatusConnectedTo => 0x804b_0004,
            ActivitySubtype::StatusSendingTo => 0x804b_0005,
            ActivitySubtype::StatusWaitingFor => 0x804b_000a,
            ActivitySubtype::StatusReceivingFrom => 0x804b_0006,
            ActivitySubtype::StatusTlsStarting => 0x804b_000c,
            ActivitySubtype::StatusTlsEnding => 0x804b_000d,
            ActivitySubtype::Other(code) => *code,
        }
    }

    /// Phase name, `None` for unknown codes
    pub fn name(&self) -> Option<&'static str> {
        let name = match self {
            ActivitySubtype::RequestHeader => "REQUEST_HEADER",
            ActivitySubtype::RequestBodySent => "REQUEST_BODY_SENT",
            ActivitySubtype::ResponseStart => "RESPONSE_START",
            ActivitySubtype::ResponseHeader => "RESPONSE_HEADER",
            ActivitySubtype::ResponseComplete => "RESPONSE_COMPLETE",
            ActivitySubtype::TransactionClose => "TRANSACTION_CLOSE",
            ActivitySubtype::StatusResolving => "STATUS_RESOLVING",
            ActivitySubtype::StatusResolved => "STATUS_RESOLVED",
            ActivitySubtype::StatusConnectingTo => "STATUS_CONNECTING_TO",
            ActivitySubtype::StatusConnectedTo => "STATUS_CONNECTED_TO",
            ActivitySubtype::StatusSendingTo => "STATUS_SENDING_TO",
            ActivitySubtype::StatusWaitingFor => "STATUS_WAITING_FOR",
            ActivitySubtype::StatusReceivingFrom => "STATUS_RECEIVING_FROM",
            ActivitySubtype::StatusTlsStarting => "STATUS_TLS_STARTING",
            ActivitySubtype::StatusTlsEnding => "STATUS_TLS_ENDING",
            ActivitySubtype::Other(_) => return None,
        };
        Some(name)
    }

    pub fn is_download(&self) -> bool {
        Self::DOWNLOAD.contains(self)
    }

    /// Whether this subtype belongs to the socket transport stream
    pub fn is_socket_status(&self) -> bool {
        self.name().is_some_and(|name| name.starts_with("STATUS_"))
    }
}

/// Human readable `TYPE:SUBTYPE` label for diagnostics
pub fn activity_type_string(activity_type: ActivityType, subtype: ActivitySubtype) -> String {
    match (activity_type, subtype.name()) {
        (ActivityType::SocketTransport, Some(name)) if subtype.is_socket_status() => {
            format!("SOCKET_TRANSPORT:{name}")
        }
        (ActivityType::HttpTransaction, Some(name)) if !subtype.is_socket_status() => {
            format!("HTTP_TRANSACTION:{name}")
        }
        _ => format!(
            "unexpected-activity-types:{}:{}",
            activity_type.code(),
            subtype.code()
        ),
    }
}

/// One high-frequency activity notification
#[derive(Clone)]
pub struct ActivityEvent {
    pub channel: Arc<dyn HttpChannel>,
    pub activity_type: ActivityType,
    pub subtype: ActivitySubtype,
    /// Microseconds since the epoch
    pub timestamp: i64,
    pub extra_size_data: u64,
    pub extra_string_data: Option<String>,
}

impl ActivityEvent {
    pub fn new(
        channel: Arc<dyn HttpChannel>,
        activity_type: ActivityType,
        subtype: ActivitySubtype,
        timestamp: i64,
    ) -> Self {
        Self {
            channel,
            activity_type,
            subtype,
            timestamp,
            extra_size_data: 0,
            extra_string_data: None,
        }
    }

    /// Build an event from raw platform codes
    pub fn from_raw(
        channel: Arc<dyn HttpChannel>,
        activity_type: u32,
        activity_subtype: u32,
        timestamp: i64,
        extra_size_data: u64,
        extra_string_data: Option<String>,
    ) -> Self {
        Self {
            channel,
            activity_type: ActivityType::from_code(activity_type),
            subtype: ActivitySubtype::from_code(activity_subtype),
            timestamp,
            extra_size_data,
            extra_string_data,
        }
    }

    pub fn with_extra_size(mut self, size: u64) -> Self {
        self.extra_size_data = size;
        self
    }

    pub fn with_extra_string(mut self, data: impl Into<String>) -> Self {
        self.extra_string_data = Some(data.into());
        self
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id()
    }

    pub fn type_string(&self) -> String {
        activity_type_string(self.activity_type, self.subtype)
    }
}

impl fmt::Debug for ActivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityEvent")
            .field("channel_id", &self.channel.channel_id())
            .field("activity_type", &self.activity_type)
            .field("subtype", &self.subtype)
            .field("timestamp", &self.timestamp)
            .field("extra_size_data", &self.extra_size_data)
            .finish()
    }
}

/// First and last time a phase was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpan {
    pub first: i64,
    pub last: i64,
}

/// Raw timestamps per lifecycle phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    spans: HashMap<ActivitySubtype, PhaseSpan>,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation; repeats only move `last`
    pub fn record(&mut self, phase: ActivitySubtype, timestamp: i64) {
        if phase.name().is_none() {
            return;
        }
        self.spans
            .entry(phase)
            .and_modify(|span| span.last = timestamp)
            .or_insert(PhaseSpan {
                first: timestamp,
                last: timestamp,
            });
    }

    /// Overwrite a phase with a single observation
    pub fn seed(&mut self, phase: ActivitySubtype, timestamp: i64) {
        self.spans.insert(
            phase,
            PhaseSpan {
                first: timestamp,
                last: timestamp,
            },
        );
    }

    pub fn get(&self, phase: ActivitySubtype) -> Option<PhaseSpan> {
        self.spans.get(&phase).copied()
    }

    pub fn contains(&self, phase: ActivitySubtype) -> bool {
        self.spans.contains_key(&phase)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Request body capture state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SentBody {
    /// Not read yet
    #[default]
    NotCaptured,
    /// Read and waiting to be handed to the owner
    Pending(String),
    /// Already handed over
    Flushed,
}

/// Per-channel bookkeeping
pub struct ActivityRecord {
    id: u64,
    channel: Arc<dyn HttpChannel>,
    url: String,
    hostname: String,
    charset: Option<String>,
    pub(crate) timings: PhaseTimings,
    pub(crate) sent_body: SentBody,
    pub(crate) body_size: u64,
    pub(crate) headers_size: u64,
    pub(crate) discard_request_body: bool,
    pub(crate) discard_response_body: bool,
    pub(crate) http_version: Option<String>,
    pub(crate) response_status: Option<u16>,
    pub(crate) response_status_text: Option<String>,
    pub(crate) is_xhr: bool,
    pub(crate) private: bool,
    pub(crate) from_service_worker: bool,
    pub(crate) blocked_reason: Option<String>,
    pub(crate) owner: Option<Arc<dyn NetworkEventOwner>>,
    pub(crate) download_throttle: Option<Arc<ThrottleListener>>,
    pub(crate) transaction_closed: bool,
    pub(crate) stop_observed: bool,
    /// A response capture listener is installed and has not stopped yet
    pub(crate) response_pending: bool,
    last_activity: Instant,
}

impl ActivityRecord {
    pub(crate) fn new(id: u64, channel: Arc<dyn HttpChannel>, save_bodies: bool) -> Self {
        let url = channel.url().to_string();
        let hostname = hostname_of(&url);
        let charset = channel.document_charset();

        Self {
            id,
            channel,
            url,
            hostname,
            charset,
            timings: PhaseTimings::new(),
            sent_body: SentBody::NotCaptured,
            body_size: 0,
            headers_size: 0,
            discard_request_body: !save_bodies,
            discard_response_body: !save_bodies,
            http_version: None,
            response_status: None,
            response_status_text: None,
            is_xhr: false,
            private: false,
            from_service_worker: false,
            blocked_reason: None,
            owner: None,
            download_throttle: None,
            transaction_closed: false,
            stop_observed: false,
            response_pending: false,
            last_activity: Instant::now(),
        }
    }

    /// Sequence id used for external correlation
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn HttpChannel> {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    pub fn sent_body(&self) -> &SentBody {
        &self.sent_body
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn discard_request_body(&self) -> bool {
        self.discard_request_body
    }

    pub fn discard_response_body(&self) -> bool {
        self.discard_response_body
    }

    pub fn response_status(&self) -> Option<u16> {
        self.response_status
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked_reason.as_deref()
    }

    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_throttled(&self) -> bool {
        self.download_throttle.is_some()
    }

    pub fn from_service_worker(&self) -> bool {
        self.from_service_worker
    }

    /// Both terminal notifications have been processed and the response
    /// body, if captured, has been handed over
    pub fn is_complete(&self) -> bool {
        self.transaction_closed && self.stop_observed && !self.response_pending
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

impl fmt::Debug for ActivityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRecord")
            .field("id", &self.id)
            .field("channel_id", &self.channel.channel_id())
            .field("url", &self.url)
            .field("timings", &self.timings)
            .field("blocked_reason", &self.blocked_reason)
            .field("has_owner", &self.owner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_codes_round_trip() {
        for code in [0x5001, 0x5006, 0x804b_0003, 0x804b_000d] {
            assert_eq!(ActivitySubtype::from_code(code).code(), code);
        }
        assert_eq!(
            ActivitySubtype::from_code(0x1234),
            ActivitySubtype::Other(0x1234)
        );
    }

    #[test]
    fn test_download_set() {
        assert!(ActivitySubtype::ResponseStart.is_download());
        assert!(ActivitySubtype::TransactionClose.is_download());
        assert!(!ActivitySubtype::RequestBodySent.is_download());
        assert!(!ActivitySubtype::StatusSendingTo.is_download());
    }

    #[test]
    fn test_activity_type_string() {
        assert_eq!(
            activity_type_string(ActivityType::SocketTransport, ActivitySubtype::StatusResolving),
            "SOCKET_TRANSPORT:STATUS_RESOLVING"
        );
        assert_eq!(
            activity_type_string(ActivityType::HttpTransaction, ActivitySubtype::RequestHeader),
            "HTTP_TRANSACTION:REQUEST_HEADER"
        );
        assert_eq!(
            activity_type_string(ActivityType::Other(7), ActivitySubtype::Other(9)),
            "unexpected-activity-types:7:9"
        );
    }

    #[test]
    fn test_phase_repeats_collapse() {
        let mut timings = PhaseTimings::new();
        timings.record(ActivitySubtype::StatusSendingTo, 10);
        timings.record(ActivitySubtype::StatusSendingTo, 15);
        timings.record(ActivitySubtype::StatusSendingTo, 20);

        assert_eq!(
            timings.get(ActivitySubtype::StatusSendingTo),
            Some(PhaseSpan { first: 10, last: 20 })
        );
        assert_eq!(timings.len(), 1);
    }

    #[test]
    fn test_unknown_phase_not_recorded() {
        let mut timings = PhaseTimings::new();
        timings.record(ActivitySubtype::Other(1), 10);
        assert!(timings.is_empty());
    }

    #[test]
    fn test_seed_overwrites() {
        let mut timings = PhaseTimings::new();
        timings.record(ActivitySubtype::RequestHeader, 10);
        timings.record(ActivitySubtype::RequestHeader, 30);
        timings.seed(ActivitySubtype::RequestHeader, 5);
        assert_eq!(
            timings.get(ActivitySubtype::RequestHeader),
            Some(PhaseSpan { first: 5, last: 5 })
        );
    }
}
