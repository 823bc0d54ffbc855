//! Record builder
//!
//! Creates activity records, materializes network events and hands request
//! and response data to the event owner.

use crate::activity::{ActivityRecord, ActivitySubtype, SentBody, SharedRecord};
use crate::channel::{scheme_of, CancelReason, HttpChannel, ListenerWrapper, StreamListener};
use crate::cookies;
use crate::observer::ObserverInner;
use crate::response_listener::{BodyPipe, ResponseCapture, StreamListenerTee};
use crate::timings::{self, bucket_ms, wait_timing};
use har_types::{NetworkEvent, PostData, ResponseStart};
use std::sync::Arc;
use tracing::{debug, trace};

/// Reason reported for requests blocked by the observer's own block list
pub const DEVTOOLS_BLOCKED_REASON: &str = "devtools";

/// Status codes whose response body is never captured
const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

/// What the caller knows about a request when materializing its event
#[derive(Debug, Clone, Default)]
pub(crate) struct EventContext {
    /// Time the request headers were sent, in microseconds
    pub timestamp: Option<i64>,
    /// Raw request header block
    pub extra_string_data: Option<String>,
    pub from_cache: bool,
    pub from_service_worker: bool,
    pub blocked_reason: Option<String>,
    pub blocking_extension: Option<String>,
    /// The request was already running when first seen
    pub in_progress: bool,
}

/// Protocol reported for a response
///
/// The negotiated ALPN id wins; otherwise the scheme, refined to the HTTP
/// version for http and https.
pub(crate) fn protocol_of(channel: &dyn HttpChannel, http_version: Option<&str>) -> String {
    match channel.protocol_version() {
        Ok(protocol) if !protocol.is_empty() && protocol != "unknown" => return protocol,
        Ok(_) => {}
        Err(e) => trace!("No ALPN protocol for channel {}: {}", channel.channel_id(), e),
    }

    let scheme = scheme_of(channel.url());
    match (scheme.as_str(), http_version) {
        ("http" | "https", Some(version)) => version.to_ascii_lowercase(),
        _ => scheme,
    }
}

/// Cache state of a channel; unreadable state counts as not cached
pub(crate) fn is_from_cache(channel: &dyn HttpChannel) -> bool {
    channel.is_from_cache().unwrap_or_else(|e| {
        trace!("Cache state unavailable for channel {}: {}", channel.channel_id(), e);
        false
    })
}

/// Keep the first `limit` characters of `text`
fn truncate_chars(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text,
    }
}

/// Parse the status line of a raw response header block
///
/// Returns the version token, status code and reason phrase.
fn parse_status_line(raw: &str) -> (Option<String>, Option<u16>, Option<String>) {
    let line = raw.lines().next().unwrap_or_default();
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|version| !version.is_empty())
        .map(str::to_string);
    let status = parts.next().and_then(|status| status.trim().parse().ok());
    let text = parts.next().map(|text| text.trim().to_string());
    (version, status, text)
}

fn content_type(raw: &str) -> Option<String> {
    raw.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-type")
            .then(|| value.trim().to_string())
    })
}

impl ObserverInner {
    /// Record for `channel`, created on first sight
    pub(crate) fn create_or_get_record(&self, channel: &Arc<dyn HttpChannel>) -> SharedRecord {
        let channel_id = channel.channel_id();
        let (save_bodies, max_tracked, ttl) = {
            let config = self.config.read();
            (
                config.save_request_and_response_bodies(),
                config.max_tracked_channels(),
                config.completed_record_ttl(),
            )
        };

        if self.records.len() >= max_tracked && self.records.get(channel_id).is_none() {
            self.records.evict_idle(ttl);
        }

        let (record, created) = self.records.get_or_insert_with(channel_id, || {
            ActivityRecord::new(self.next_id(), channel.clone(), save_bodies)
        });
        if created {
            trace!("Tracking channel {} ({})", channel_id, channel.url());
        }
        record
    }

    /// Materialize the network event of a request and notify the consumer
    ///
    /// At most one event is created per record; later calls return the
    /// existing record unchanged.
    pub(crate) fn create_network_event(
        &self,
        channel: &Arc<dyn HttpChannel>,
        context: EventContext,
    ) -> SharedRecord {
        let record = self.create_or_get_record(channel);
        if record.lock().has_owner() {
            return record;
        }

        let mut blocked_reason = context.blocked_reason.clone();
        if blocked_reason.is_none() && self.blocked_urls.read().matches(channel.url()) {
            if let Err(e) = channel.cancel(CancelReason::BindingAborted) {
                debug!("Cancel of blocked channel {} failed: {}", channel.channel_id(), e);
            }
            blocked_reason = Some(DEVTOOLS_BLOCKED_REASON.to_string());
        }

        let event = {
            let mut record = record.lock();
            if let Some(timestamp) = context.timestamp {
                record.timings.seed(ActivitySubtype::RequestHeader, timestamp);
            }
            record.is_xhr = channel.is_xhr();
            record.private = channel.is_private();
            record.from_service_worker = context.from_service_worker;
            record.blocked_reason = blocked_reason.clone();
            // A blocked request never opens a transaction
            if blocked_reason.is_some() {
                record.transaction_closed = true;
            }
            record.touch();

            NetworkEvent {
                resource_id: record.id(),
                channel_id: channel.channel_id(),
                url: record.url().to_string(),
                method: channel.method().to_string(),
                timestamp: context.timestamp,
                is_xhr: record.is_xhr,
                private: record.private,
                from_cache: context.from_cache,
                from_service_worker: context.from_service_worker,
                blocked_reason,
                blocking_extension: context.blocking_extension.clone(),
                discard_request_body: record.discard_request_body,
                discard_response_body: record.discard_response_body,
                raw_headers: context.extra_string_data.clone(),
            }
        };

        // The consumer may call back into the observer
        let owner = self.invoke_on_network_event(&event, channel);
        record.lock().owner = Some(owner.clone());
        debug!(
            "Network event {} for {} {}{}",
            event.resource_id,
            event.method,
            event.url,
            if event.is_blocked() { " (blocked)" } else { "" }
        );

        if !event.is_blocked() && !context.in_progress {
            self.setup_response_listener(&record, context.from_cache);
        }

        let headers = channel.request_headers().unwrap_or_else(|e| {
            debug!("Request headers unavailable for {}: {}", event.url, e);
            Vec::new()
        });
        let request_cookies = cookies::request_cookies(&headers);
        owner.add_request_headers(headers, context.extra_string_data.as_deref());
        owner.add_request_cookies(request_cookies);

        record
    }

    /// Splice the throttle and the body capture into the response stream
    fn setup_response_listener(&self, record: &SharedRecord, from_cache: bool) {
        let channel = record.lock().channel().clone();

        if !from_cache {
            if let Some(listener) = self.throttler().and_then(|t| t.manage(channel.as_ref())) {
                record.lock().download_throttle = Some(listener);
            }
        }

        let (segment_size, limit) = {
            let config = self.config.read();
            (config.response_pipe_segment_size(), config.response_body_limit())
        };
        let pipe = BodyPipe::new(segment_size);
        let observer = self.this.clone();
        let capture = ResponseCapture::new(record, pipe.clone(), limit).on_complete(Box::new(
            move |record: &SharedRecord| {
                if let Some(observer) = observer.upgrade() {
                    observer.maybe_release(record);
                }
            },
        ));

        let wrap: ListenerWrapper = Box::new(move |original: Box<dyn StreamListener>| {
            Box::new(StreamListenerTee::new(original, pipe, capture)) as Box<dyn StreamListener>
        });

        record.lock().response_pending = true;
        if let Err(e) = channel.set_new_listener(wrap) {
            debug!("Response body of channel {} not captured: {}", channel.channel_id(), e);
            record.lock().response_pending = false;
        }
    }

    /// Handle the raw response header block
    pub(crate) fn on_response_header(&self, record: &SharedRecord, raw: &str) {
        let (version, status, status_text) = parse_status_line(raw);
        let headers_size = raw.len() as u64;

        let (owner, response) = {
            let mut record = record.lock();
            let Some(owner) = record.owner.clone() else {
                return;
            };
            let channel = record.channel().clone();

            record.headers_size = headers_size;
            record.http_version = version.clone();
            record.response_status = status;
            record.response_status_text = status_text.clone();
            if status.is_some_and(|status| REDIRECT_STATUSES.contains(&status)) {
                record.discard_response_body = true;
            }

            let response = ResponseStart {
                protocol: protocol_of(channel.as_ref(), version.as_deref()),
                http_version: version,
                from_cache: is_from_cache(channel.as_ref()),
                remote_address: channel.remote_address().unwrap_or_default(),
                remote_port: channel.remote_port(),
                status,
                status_text,
                body_size: record.body_size,
                headers_size,
                transferred_size: record.body_size + headers_size,
                waiting_time: bucket_ms(wait_timing(&record.timings)),
                mime_type: content_type(raw),
                discard_response_body: record.discard_response_body,
            };
            (owner, response)
        };

        owner.add_response_start(response, raw);
    }

    /// Read the request body once, before or after it is uploaded
    pub(crate) fn on_request_body_sent(&self, record: &SharedRecord) {
        let (channel, url, charset) = {
            let record = record.lock();
            if record.discard_request_body || *record.sent_body() != SentBody::NotCaptured {
                return;
            }
            (
                record.channel().clone(),
                record.url().to_string(),
                record.charset().map(str::to_string),
            )
        };

        let mut text = channel.read_post_text(charset.as_deref());
        if text.is_some() {
            if let Some(page) = &self.page {
                // Top level form submissions keep the body in the page
                if page.page_url().as_deref() == Some(url.as_str()) {
                    text = page.read_post_text_from_page(charset.as_deref());
                }
            }
        }

        if let Some(text) = text {
            record.lock().sent_body = SentBody::Pending(text);
        }
    }

    /// Hand a pending request body to the owner, truncated to the limit
    pub(crate) fn send_request_body(&self, record: &SharedRecord) {
        let (owner, body) = {
            let mut record = record.lock();
            let Some(owner) = record.owner.clone() else {
                return;
            };
            match std::mem::replace(&mut record.sent_body, SentBody::Flushed) {
                SentBody::Pending(body) => (owner, body),
                other => {
                    record.sent_body = other;
                    return;
                }
            }
        };

        let limit = self.config.read().request_body_limit();
        let size = body.chars().count();
        let text = if limit > 0 && size > limit {
            truncate_chars(body, limit)
        } else {
            body
        };
        owner.add_request_post_data(PostData { text, size });
    }

    /// Emit the final timings of a transaction
    pub(crate) fn on_transaction_close(&self, record: &SharedRecord) {
        let (owner, phases, channel) = {
            let mut record = record.lock();
            record.transaction_closed = true;
            (
                record.owner.clone(),
                record.timings.clone(),
                record.channel().clone(),
            )
        };

        if let Some(owner) = owner {
            let timed = channel.timed_channel();
            let result = timings::reconstruct(&phases, timed.as_ref(), false);
            trace!(
                "Channel {} total {} ms {:?}",
                channel.channel_id(),
                result.total,
                result.timings
            );
            owner.add_event_timings(
                result.total,
                result.timings,
                result.offsets,
                channel.server_timings(),
            );
        }

        self.maybe_release(record);
    }

    /// Drop the record once nothing else will be reported for it
    pub(crate) fn maybe_release(&self, record: &SharedRecord) {
        let (complete, channel_id) = {
            let record = record.lock();
            (record.is_complete(), record.channel_id())
        };
        if !complete {
            return;
        }

        if let Some(current) = self.records.get(channel_id) {
            if Arc::ptr_eq(&current, record) {
                self.records.remove(channel_id);
                trace!("Released record of channel {}", channel_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;

    #[test]
    fn test_parse_status_line() {
        let (version, status, text) =
            parse_status_line("HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n");
        assert_eq!(version.as_deref(), Some("HTTP/1.1"));
        assert_eq!(status, Some(404));
        assert_eq!(text.as_deref(), Some("Not Found"));

        let (version, status, text) = parse_status_line("HTTP/2 200\r\n");
        assert_eq!(version.as_deref(), Some("HTTP/2"));
        assert_eq!(status, Some(200));
        assert_eq!(text, None);

        assert_eq!(parse_status_line(""), (None, None, None));
    }

    #[test]
    fn test_content_type() {
        let raw = "HTTP/1.1 200 OK\r\ncontent-type: application/json; charset=utf-8\r\n\r\n";
        assert_eq!(
            content_type(raw).as_deref(),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(content_type("HTTP/1.1 204 No Content\r\n\r\n"), None);
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate_chars("abcdef".to_string(), 3), "abc");
        assert_eq!(truncate_chars("aéb".to_string(), 2), "aé");
        assert_eq!(truncate_chars("ééééé".to_string(), 4), "éééé");
        assert_eq!(truncate_chars("ab".to_string(), 10), "ab");
    }

    #[test]
    fn test_protocol_of() {
        let alpn = MockChannel::builder(1, "https://example.com/")
            .protocol("h2")
            .build();
        assert_eq!(protocol_of(alpn.as_ref(), Some("HTTP/2")), "h2");

        let unknown = MockChannel::builder(2, "https://example.com/")
            .protocol("unknown")
            .build();
        assert_eq!(protocol_of(unknown.as_ref(), Some("HTTP/1.1")), "http/1.1");

        let plain = MockChannel::builder(3, "http://example.com/").build();
        assert_eq!(protocol_of(plain.as_ref(), None), "http");
    }

    #[test]
    fn test_is_from_cache_defaults_false() {
        let cached = MockChannel::builder(1, "https://example.com/")
            .from_cache(true)
            .build();
        assert!(is_from_cache(cached.as_ref()));

        let plain = MockChannel::get(2, "https://example.com/");
        assert!(!is_from_cache(plain.as_ref()));
    }
}
