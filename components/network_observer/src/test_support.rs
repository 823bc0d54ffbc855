//! In-memory channel, owner and listener doubles
//!
//! Enabled for unit tests and, through the `test-support` feature, for
//! integration tests of crates embedding the observer.

use crate::activity::{ActivityEvent, ActivitySubtype, ActivityType};
use crate::channel::{
    BlockedReason, CancelReason, ChannelId, ChannelStatus, HttpChannel, ListenerWrapper,
    PageContext, StreamListener, TimedChannelInfo, UploadThrottle,
};
use crate::notification::Notification;
use crate::owner::NetworkEventOwner;
use har_types::{
    ChannelError, Cookie, HarOffsets, HarTimings, Header, NetworkEvent, PostData, ResponseContent,
    ResponseStart, ServerTiming,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct RecordedStream {
    started: bool,
    received: Vec<u8>,
    stopped: Option<ChannelStatus>,
}

/// Terminal listener that keeps everything it is given
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    state: Arc<Mutex<RecordedStream>>,
}

impl RecordingListener {
    pub fn started(&self) -> bool {
        self.state.lock().started
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.lock().received.clone()
    }

    pub fn stopped(&self) -> Option<ChannelStatus> {
        self.state.lock().stopped
    }
}

impl StreamListener for RecordingListener {
    fn on_start_request(&mut self) {
        self.state.lock().started = true;
    }

    fn on_data_available(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.state.lock().received.extend_from_slice(data);
        Ok(())
    }

    fn on_stop_request(&mut self, status: ChannelStatus) {
        self.state.lock().stopped = Some(status);
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelProps {
    method: String,
    request_headers: Vec<Header>,
    response_headers: Vec<Header>,
    response_version: Option<(u32, u32)>,
    response_status: Option<u16>,
    response_status_text: Option<String>,
    protocol: Option<String>,
    from_cache: bool,
    remote_address: Option<String>,
    remote_port: Option<u16>,
    timed: Option<TimedChannelInfo>,
    server_timings: Option<Vec<ServerTiming>>,
    post_text: Option<String>,
    blocked: Option<BlockedReason>,
    preload: bool,
    xhr: bool,
}

/// Scriptable [`HttpChannel`]
pub struct MockChannel {
    id: ChannelId,
    url: String,
    props: ChannelProps,
    status: Mutex<ChannelStatus>,
    cancels: Mutex<Vec<CancelReason>>,
    original: RecordingListener,
    listener: Mutex<Option<Box<dyn StreamListener>>>,
    spliced: Mutex<usize>,
    upload_throttle: Mutex<Option<UploadThrottle>>,
}

impl MockChannel {
    /// Plain GET channel
    pub fn get(id: ChannelId, url: &str) -> Arc<dyn HttpChannel> {
        Self::builder(id, url).build()
    }

    pub fn builder(id: ChannelId, url: &str) -> MockChannelBuilder {
        MockChannelBuilder {
            id,
            url: url.to_string(),
            status: ChannelStatus::Success,
            props: ChannelProps {
                method: "GET".to_string(),
                ..Default::default()
            },
        }
    }

    /// Same channel behind the trait object the observer sees
    pub fn handle(self: &Arc<Self>) -> Arc<dyn HttpChannel> {
        self.clone()
    }

    pub fn cancels(&self) -> Vec<CancelReason> {
        self.cancels.lock().clone()
    }

    /// Listeners spliced in front of the original one
    pub fn spliced_listeners(&self) -> usize {
        *self.spliced.lock()
    }

    pub fn upload_throttle(&self) -> Option<UploadThrottle> {
        *self.upload_throttle.lock()
    }

    /// Bytes that reached the page's own listener
    pub fn received(&self) -> Vec<u8> {
        self.original.received()
    }

    pub fn original_listener(&self) -> &RecordingListener {
        &self.original
    }

    pub fn set_status(&self, status: ChannelStatus) {
        *self.status.lock() = status;
    }

    fn with_listener<F>(&self, f: F) -> Result<(), ChannelError>
    where
        F: FnOnce(&mut dyn StreamListener) -> Result<(), ChannelError>,
    {
        // Listeners may call back into the channel
        let mut listener = self.listener.lock().take().ok_or(ChannelError::AlreadyFinished)?;
        let result = f(listener.as_mut());
        *self.listener.lock() = Some(listener);
        result
    }

    pub fn start(&self) {
        let _ = self.with_listener(|listener| {
            listener.on_start_request();
            Ok(())
        });
    }

    pub fn deliver(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.with_listener(|listener| listener.on_data_available(data))
    }

    pub fn finish(&self, status: ChannelStatus) {
        self.set_status(status);
        let _ = self.with_listener(|listener| {
            listener.on_stop_request(status);
            Ok(())
        });
    }
}

/// Builder for [`MockChannel`]
pub struct MockChannelBuilder {
    id: ChannelId,
    url: String,
    status: ChannelStatus,
    props: ChannelProps,
}

impl MockChannelBuilder {
    pub fn method(mut self, method: &str) -> Self {
        self.props.method = method.to_string();
        self
    }

    pub fn request_header(mut self, name: &str, value: &str) -> Self {
        self.props.request_headers.push(Header::new(name, value));
        self
    }

    pub fn response_header(mut self, name: &str, value: &str) -> Self {
        self.props.response_headers.push(Header::new(name, value));
        self
    }

    pub fn response(mut self, version: (u32, u32), status: u16, text: &str) -> Self {
        self.props.response_version = Some(version);
        self.props.response_status = Some(status);
        self.props.response_status_text = Some(text.to_string());
        self
    }

    pub fn protocol(mut self, protocol: &str) -> Self {
        self.props.protocol = Some(protocol.to_string());
        self
    }

    pub fn from_cache(mut self, from_cache: bool) -> Self {
        self.props.from_cache = from_cache;
        self
    }

    pub fn remote(mut self, address: &str, port: u16) -> Self {
        self.props.remote_address = Some(address.to_string());
        self.props.remote_port = Some(port);
        self
    }

    pub fn timed(mut self, timed: TimedChannelInfo) -> Self {
        self.props.timed = Some(timed);
        self
    }

    pub fn server_timings(mut self, timings: Vec<ServerTiming>) -> Self {
        self.props.server_timings = Some(timings);
        self
    }

    pub fn post_text(mut self, text: &str) -> Self {
        self.props.post_text = Some(text.to_string());
        self
    }

    pub fn blocked(mut self, reason: BlockedReason) -> Self {
        self.props.blocked = Some(reason);
        self
    }

    pub fn status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn preload(mut self, preload: bool) -> Self {
        self.props.preload = preload;
        self
    }

    pub fn xhr(mut self, xhr: bool) -> Self {
        self.props.xhr = xhr;
        self
    }

    pub fn build(self) -> Arc<MockChannel> {
        let original = RecordingListener::default();
        Arc::new(MockChannel {
            id: self.id,
            url: self.url,
            props: self.props,
            status: Mutex::new(self.status),
            cancels: Mutex::new(Vec::new()),
            listener: Mutex::new(Some(Box::new(original.clone()))),
            original,
            spliced: Mutex::new(0),
            upload_throttle: Mutex::new(None),
        })
    }
}

impl HttpChannel for MockChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn method(&self) -> &str {
        &self.props.method
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    fn blocked_reason(&self) -> Option<BlockedReason> {
        self.props.blocked.clone()
    }

    fn cancel(&self, reason: CancelReason) -> Result<(), ChannelError> {
        self.cancels.lock().push(reason);
        *self.status.lock() = ChannelStatus::BindingAborted;
        Ok(())
    }

    fn request_headers(&self) -> Result<Vec<Header>, ChannelError> {
        Ok(self.props.request_headers.clone())
    }

    fn original_response_headers(&self) -> Result<Vec<Header>, ChannelError> {
        if self.props.response_headers.is_empty() {
            return Err(ChannelError::NotAvailable("response headers"));
        }
        Ok(self.props.response_headers.clone())
    }

    fn response_version(&self) -> Option<(u32, u32)> {
        self.props.response_version
    }

    fn response_status(&self) -> Option<u16> {
        self.props.response_status
    }

    fn response_status_text(&self) -> Option<String> {
        self.props.response_status_text.clone()
    }

    fn protocol_version(&self) -> Result<String, ChannelError> {
        self.props
            .protocol
            .clone()
            .ok_or(ChannelError::NotAvailable("protocol"))
    }

    fn is_from_cache(&self) -> Result<bool, ChannelError> {
        Ok(self.props.from_cache)
    }

    fn remote_address(&self) -> Option<String> {
        self.props.remote_address.clone()
    }

    fn remote_port(&self) -> Option<u16> {
        self.props.remote_port
    }

    fn timed_channel(&self) -> Option<TimedChannelInfo> {
        self.props.timed
    }

    fn server_timings(&self) -> Option<Vec<ServerTiming>> {
        self.props.server_timings.clone()
    }

    fn read_post_text(&self, _charset: Option<&str>) -> Option<String> {
        self.props.post_text.clone()
    }

    fn is_preload(&self) -> bool {
        self.props.preload
    }

    fn is_xhr(&self) -> bool {
        self.props.xhr
    }

    fn set_new_listener(&self, wrap: ListenerWrapper) -> Result<(), ChannelError> {
        let mut slot = self.listener.lock();
        let current = slot.take().ok_or(ChannelError::AlreadyFinished)?;
        *slot = Some(wrap(current));
        *self.spliced.lock() += 1;
        Ok(())
    }

    fn set_upload_throttle(&self, throttle: UploadThrottle) -> Result<(), ChannelError> {
        *self.upload_throttle.lock() = Some(throttle);
        Ok(())
    }
}

/// Page whose post text is cached by navigation
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub url: Option<String>,
    pub post_text: Option<String>,
}

impl PageContext for MockPage {
    fn page_url(&self) -> Option<String> {
        self.url.clone()
    }

    fn read_post_text_from_page(&self, _charset: Option<&str>) -> Option<String> {
        self.post_text.clone()
    }
}

/// Everything an owner was told, in call order per kind
#[derive(Debug, Clone, Default)]
pub struct OwnerLog {
    pub request_headers: Option<(Vec<Header>, Option<String>)>,
    pub request_cookies: Vec<Cookie>,
    pub post_data: Vec<PostData>,
    pub response_start: Option<(ResponseStart, String)>,
    pub response_headers: Vec<Header>,
    pub response_cookies: Vec<Cookie>,
    pub server_timings_calls: usize,
    pub event_timings: Vec<(i64, HarTimings, HarOffsets)>,
    pub response_content: Option<ResponseContent>,
}

/// [`NetworkEventOwner`] that records every call
#[derive(Debug, Default)]
pub struct MockOwner {
    log: Mutex<OwnerLog>,
}

impl MockOwner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> OwnerLog {
        self.log.lock().clone()
    }

    pub fn post_data(&self) -> Vec<PostData> {
        self.log.lock().post_data.clone()
    }

    pub fn response_start(&self) -> Option<ResponseStart> {
        self.log.lock().response_start.clone().map(|(start, _)| start)
    }

    pub fn event_timings(&self) -> Option<(i64, HarTimings, HarOffsets)> {
        self.log.lock().event_timings.last().copied()
    }

    pub fn response_content(&self) -> Option<ResponseContent> {
        self.log.lock().response_content.clone()
    }
}

impl NetworkEventOwner for MockOwner {
    fn add_request_headers(&self, headers: Vec<Header>, raw_headers: Option<&str>) {
        self.log.lock().request_headers = Some((headers, raw_headers.map(str::to_string)));
    }

    fn add_request_cookies(&self, cookies: Vec<Cookie>) {
        self.log.lock().request_cookies = cookies;
    }

    fn add_request_post_data(&self, post_data: PostData) {
        self.log.lock().post_data.push(post_data);
    }

    fn add_response_start(&self, response: ResponseStart, raw_headers: &str) {
        self.log.lock().response_start = Some((response, raw_headers.to_string()));
    }

    fn add_response_headers(&self, headers: Vec<Header>) {
        self.log.lock().response_headers = headers;
    }

    fn add_response_cookies(&self, cookies: Vec<Cookie>) {
        self.log.lock().response_cookies = cookies;
    }

    fn add_server_timings(&self, _server_timings: Option<Vec<ServerTiming>>) {
        self.log.lock().server_timings_calls += 1;
    }

    fn add_event_timings(
        &self,
        total: i64,
        timings: HarTimings,
        offsets: HarOffsets,
        _server_timings: Option<Vec<ServerTiming>>,
    ) {
        self.log.lock().event_timings.push((total, timings, offsets));
    }

    fn add_response_content(&self, content: ResponseContent) {
        self.log.lock().response_content = Some(content);
    }
}

/// Consumer collecting every network event with a fresh [`MockOwner`]
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<(NetworkEvent, Arc<MockOwner>)>>,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `on_network_event` callback feeding this collector
    pub fn callback(
        self: &Arc<Self>,
    ) -> impl Fn(&NetworkEvent, &Arc<dyn HttpChannel>) -> Arc<dyn NetworkEventOwner>
           + Send
           + Sync
           + 'static {
        let collector = self.clone();
        move |event: &NetworkEvent, _channel: &Arc<dyn HttpChannel>| {
            let owner = MockOwner::new();
            collector.events.lock().push((event.clone(), owner.clone()));
            owner as Arc<dyn NetworkEventOwner>
        }
    }

    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().iter().map(|(event, _)| event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Owner created for the event of `channel_id`
    pub fn owner(&self, channel_id: ChannelId) -> Option<Arc<MockOwner>> {
        self.events
            .lock()
            .iter()
            .find(|(event, _)| event.channel_id == channel_id)
            .map(|(_, owner)| owner.clone())
    }
}

/// Activity notification with the activity type matching `subtype`
pub fn activity(channel: &Arc<dyn HttpChannel>, subtype: ActivitySubtype, timestamp: i64) -> Notification {
    let activity_type = if subtype.is_socket_status() {
        ActivityType::SocketTransport
    } else {
        ActivityType::HttpTransaction
    };
    Notification::Activity(ActivityEvent::new(
        channel.clone(),
        activity_type,
        subtype,
        timestamp,
    ))
}
