//! Consumer boundary
//!
//! Reconstructed request data leaves the observer only through a
//! [`NetworkEventOwner`], returned by the consumer's `on_network_event`
//! callback the first time a request is materialized.

use crate::channel::HttpChannel;
use har_types::{
    Cookie, HarOffsets, HarTimings, Header, NetworkEvent, PostData, ResponseContent,
    ResponseStart, ServerTiming,
};
use std::sync::Arc;

/// Receiver of structured data for one request
pub trait NetworkEventOwner: Send + Sync {
    /// Request headers and the raw header block when the transaction supplied one
    fn add_request_headers(&self, headers: Vec<Header>, raw_headers: Option<&str>);

    fn add_request_cookies(&self, cookies: Vec<Cookie>);

    fn add_request_post_data(&self, post_data: PostData);

    fn add_response_start(&self, response: ResponseStart, raw_headers: &str);

    fn add_response_headers(&self, headers: Vec<Header>);

    fn add_response_cookies(&self, cookies: Vec<Cookie>);

    fn add_server_timings(&self, server_timings: Option<Vec<ServerTiming>>);

    /// Final timing record; called once per request
    fn add_event_timings(
        &self,
        total: i64,
        timings: HarTimings,
        offsets: HarOffsets,
        server_timings: Option<Vec<ServerTiming>>,
    );

    /// Captured response body
    fn add_response_content(&self, _content: ResponseContent) {}
}

/// Decides whether a channel is observed at all
pub type IgnoreChannelFn = Arc<dyn Fn(&dyn HttpChannel) -> bool + Send + Sync>;

/// Materializes the owner for a newly observed request
pub type OnNetworkEventFn =
    Arc<dyn Fn(&NetworkEvent, &Arc<dyn HttpChannel>) -> Arc<dyn NetworkEventOwner> + Send + Sync>;
