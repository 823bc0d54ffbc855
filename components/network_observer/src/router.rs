//! Event router
//!
//! Filters incoming notifications and dispatches them to the per-topic
//! handlers. Every handler runs behind [`run_isolated`], so a failure while
//! processing one channel never reaches the notification source.

use crate::activity::{ActivityEvent, ActivityRecord, ActivitySubtype, ActivityType, SharedRecord};
use crate::builder::{is_from_cache, protocol_of, EventContext};
use crate::channel::HttpChannel;
use crate::cookies;
use crate::notification::{Notification, NotificationObserver};
use crate::observer::ObserverInner;
use har_types::{HarTimingResult, ObserverError, ResponseStart};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Run one handler, logging instead of propagating failures and panics
pub(crate) fn run_isolated<F>(label: &str, handler: F)
where
    F: FnOnce() -> Result<(), ObserverError>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => {}
        Ok(Err(ObserverError::Channel(e))) if e.is_expected() => {
            debug!("{}: {}", label, e);
        }
        Ok(Err(e)) => warn!("{} failed: {}", label, e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("{} panicked: {}", label, message);
        }
    }
}

/// How a response reached the examine handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Live,
    Cached,
    /// Opening failed, there is no response
    Failed,
}

impl NotificationObserver for ObserverInner {
    fn observe(&self, notification: &Notification) {
        if self.is_destroyed() {
            return;
        }

        let channel = notification.channel();
        if !channel.is_http() {
            return;
        }

        let label = match notification {
            Notification::Activity(event) => {
                if matches!(event.activity_type, ActivityType::Other(_)) {
                    return;
                }
                // Only the first activity of a request can create a record
                if event.subtype == ActivitySubtype::RequestHeader
                    && (self.ignore_channel)(channel.as_ref())
                {
                    return;
                }
                event.type_string()
            }
            other => {
                if (self.ignore_channel)(channel.as_ref()) {
                    return;
                }
                other.topic().to_string()
            }
        };

        if self.config.read().log_platform_events() {
            debug!("{} channel={} {}", label, channel.channel_id(), channel.url());
        }

        run_isolated(&label, || self.dispatch(notification));
    }
}

impl ObserverInner {
    fn dispatch(&self, notification: &Notification) -> Result<(), ObserverError> {
        match notification {
            Notification::ModifyRequest(channel) => self.on_modify_request(channel),
            Notification::ExamineResponse(channel) => {
                self.examine_response(channel, ResponseKind::Live)
            }
            Notification::ExamineCachedResponse(channel) => {
                self.examine_response(channel, ResponseKind::Cached)
            }
            Notification::FailedOpeningRequest(channel) => self.on_failed_opening(channel),
            Notification::StopRequest(channel) => self.on_stop_request(channel),
            Notification::ServiceWorkerSynthesizedResponse(channel) => {
                self.on_service_worker_response(channel)
            }
            Notification::Activity(event) => self.observe_activity(event),
        }
    }

    fn observe_activity(&self, event: &ActivityEvent) -> Result<(), ObserverError> {
        if event.subtype == ActivitySubtype::RequestHeader {
            let context = EventContext {
                timestamp: Some(event.timestamp),
                extra_string_data: event.extra_string_data.clone(),
                ..Default::default()
            };
            self.create_network_event(&event.channel, context);
            return Ok(());
        }

        // Channels opened before observation started have no record
        let Some(record) = self.records.get(event.channel_id()) else {
            return Ok(());
        };

        let throttle = record.lock().download_throttle.clone();
        match throttle {
            Some(throttle) if event.subtype.is_download() => {
                let observer = self.this.clone();
                let weak_record = Arc::downgrade(&record);
                throttle.add_activity_callback(
                    event.clone(),
                    Box::new(move |event: ActivityEvent| dispatch_deferred(&observer, &weak_record, event)),
                );
                Ok(())
            }
            _ => self.dispatch_activity(&record, event),
        }
    }

    pub(crate) fn dispatch_activity(
        &self,
        record: &SharedRecord,
        event: &ActivityEvent,
    ) -> Result<(), ObserverError> {
        {
            let mut record = record.lock();
            record.timings.record(event.subtype, event.timestamp);
            record.touch();
        }

        match event.subtype {
            ActivitySubtype::RequestBodySent => {
                self.on_request_body_sent(record);
                self.send_request_body(record);
            }
            ActivitySubtype::ResponseHeader => {
                let raw = event.extra_string_data.as_deref().unwrap_or_default();
                self.on_response_header(record, raw);
            }
            ActivitySubtype::TransactionClose => self.on_transaction_close(record),
            _ => {}
        }
        Ok(())
    }

    fn on_modify_request(&self, channel: &Arc<dyn HttpChannel>) -> Result<(), ObserverError> {
        let Some(throttler) = self.throttler() else {
            return Ok(());
        };

        // Read the body before the upload is throttled
        let record = self.create_or_get_record(channel);
        self.on_request_body_sent(&record);
        throttler.manage_upload(channel.as_ref());
        Ok(())
    }

    fn examine_response(
        &self,
        channel: &Arc<dyn HttpChannel>,
        kind: ResponseKind,
    ) -> Result<(), ObserverError> {
        let mut response_headers = Vec::new();
        let mut response_cookies = Vec::new();
        let mut http_version = None;
        let mut status = None;
        let mut status_text = None;

        if kind != ResponseKind::Failed {
            response_headers = channel.original_response_headers()?;
            if response_headers.is_empty() {
                return Ok(());
            }
            response_cookies = cookies::response_cookies(&response_headers);

            http_version = channel.response_version().map(|(major, minor)| {
                if major > 1 {
                    format!("HTTP/{major}")
                } else {
                    format!("HTTP/{major}.{minor}")
                }
            });
            status = channel.response_status();
            status_text = channel.response_status_text();
        }

        let record = self.create_or_get_record(channel);

        match kind {
            ResponseKind::Cached => {
                let from_service_worker =
                    self.intercepted.lock().remove(&channel.channel_id());

                // Cached and synthesized responses never produced a request event
                if !record.lock().has_owner() {
                    let context = EventContext {
                        from_cache: !from_service_worker,
                        from_service_worker,
                        ..Default::default()
                    };
                    self.create_network_event(channel, context);
                }

                self.on_request_body_sent(&record);
                self.send_request_body(&record);

                let (owner, response) = {
                    let mut record = record.lock();
                    record.http_version = http_version.clone();
                    let response = ResponseStart {
                        protocol: protocol_of(channel.as_ref(), http_version.as_deref()),
                        http_version,
                        from_cache: is_from_cache(channel.as_ref()),
                        remote_address: String::new(),
                        remote_port: None,
                        status,
                        status_text,
                        body_size: 0,
                        headers_size: 0,
                        transferred_size: 0,
                        waiting_time: 0,
                        mime_type: None,
                        discard_response_body: record.discard_response_body,
                    };
                    // No transaction will close for this channel
                    record.transaction_closed = true;
                    (record.owner.clone(), response)
                };

                if let Some(owner) = owner {
                    owner.add_response_start(response, "");
                    let result = HarTimingResult::cached();
                    owner.add_event_timings(
                        result.total,
                        result.timings,
                        result.offsets,
                        channel.server_timings(),
                    );
                }
            }
            ResponseKind::Failed => {
                let blocked = channel.blocked_reason();
                let context = EventContext {
                    blocked_reason: blocked.as_ref().map(|b| b.reason.clone()),
                    blocking_extension: blocked.and_then(|b| b.extension),
                    ..Default::default()
                };
                self.create_network_event(channel, context);
                record.lock().transaction_closed = true;
            }
            ResponseKind::Live => {}
        }

        let owner = record.lock().owner.clone();
        if let Some(owner) = owner {
            owner.add_response_headers(response_headers);
            owner.add_response_cookies(response_cookies);
        }

        self.maybe_release(&record);
        Ok(())
    }

    fn on_failed_opening(&self, channel: &Arc<dyn HttpChannel>) -> Result<(), ObserverError> {
        // A failed preload is retried by the platform as a real request
        if channel.is_preload() {
            debug!("Ignoring failed preload of {}", channel.url());
            return Ok(());
        }
        self.examine_response(channel, ResponseKind::Failed)
    }

    fn on_stop_request(&self, channel: &Arc<dyn HttpChannel>) -> Result<(), ObserverError> {
        let record = self.create_or_get_record(channel);
        let owner = record.lock().owner.clone();

        match owner {
            Some(owner) => owner.add_server_timings(channel.server_timings()),
            // Observation started while the request was already running
            None if channel.status().is_success() => {
                let context = EventContext {
                    in_progress: true,
                    ..Default::default()
                };
                self.create_network_event(channel, context);
            }
            // Blocked before any other notification fired
            None => {
                let blocked = channel.blocked_reason();
                let context = EventContext {
                    blocked_reason: blocked.as_ref().map(|b| b.reason.clone()),
                    blocking_extension: blocked.and_then(|b| b.extension),
                    in_progress: true,
                    ..Default::default()
                };
                self.create_network_event(channel, context);
                record.lock().transaction_closed = true;
            }
        }

        {
            let mut record = record.lock();
            record.stop_observed = true;
            record.touch();
        }
        self.maybe_release(&record);
        Ok(())
    }

    fn on_service_worker_response(
        &self,
        channel: &Arc<dyn HttpChannel>,
    ) -> Result<(), ObserverError> {
        self.intercepted.lock().insert(channel.channel_id());
        // Service workers never fire the cached-response notification
        self.examine_response(channel, ResponseKind::Cached)
    }
}

fn dispatch_deferred(
    observer: &Weak<ObserverInner>,
    record: &Weak<Mutex<ActivityRecord>>,
    event: ActivityEvent,
) {
    let (Some(observer), Some(record)) = (observer.upgrade(), record.upgrade()) else {
        return;
    };
    if observer.is_destroyed() {
        return;
    }
    let label = event.type_string();
    run_isolated(&label, || observer.dispatch_activity(&record, &event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use har_types::ChannelError;

    #[test]
    fn test_run_isolated_swallows_errors() {
        run_isolated("ok", || Ok(()));
        run_isolated("expected", || {
            Err(ChannelError::NotAvailable("headers").into())
        });
        run_isolated("config", || Err(ObserverError::configuration("bad")));
    }

    #[test]
    fn test_run_isolated_catches_panics() {
        let mut reached = false;
        run_isolated("panic", || panic!("handler bug"));
        run_isolated("after", || {
            reached = true;
            Ok(())
        });
        assert!(reached);
    }
}
