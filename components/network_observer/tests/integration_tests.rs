//! Integration tests for the network observer
//!
//! Cross-module scenarios: routing, record building and eviction working
//! together behind the public API.

use network_observer::har_types::PostData;
use network_observer::test_support::{activity, EventCollector, MockChannel, MockPage};
use network_observer::{
    ActivitySubtype, BlockedReason, HttpChannel, NetworkObserver, Notification,
    NotificationCenter, ObserverConfig, ProcessType,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const MS: i64 = 1000;

fn observer_with(
    config: ObserverConfig,
    page: Option<MockPage>,
) -> (Arc<NotificationCenter>, NetworkObserver, Arc<EventCollector>) {
    let center = NotificationCenter::new();
    let collector = EventCollector::new();
    let mut builder = NetworkObserver::builder()
        .ignore_channel(|_: &dyn HttpChannel| false)
        .on_network_event(collector.callback())
        .config(config);
    if let Some(page) = page {
        builder = builder.page_context(Arc::new(page));
    }
    let observer = assert_ok!(builder.build(&center));
    (center, observer, collector)
}

fn post(center: &NotificationCenter, channel: &Arc<dyn HttpChannel>) {
    center.publish(activity(channel, ActivitySubtype::RequestHeader, 0));
    center.publish(activity(channel, ActivitySubtype::RequestBodySent, MS));
}

fn form_page() -> MockPage {
    MockPage {
        url: Some("https://example.com/login".to_string()),
        post_text: Some("user=page".to_string()),
    }
}

#[test]
fn test_top_level_form_body_read_from_page() {
    let (center, _observer, collector) = observer_with(ObserverConfig::default(), Some(form_page()));
    let channel = MockChannel::builder(1, "https://example.com/login")
        .method("POST")
        .post_text("user=wire")
        .build()
        .handle();

    post(&center, &channel);

    assert_eq!(
        collector.owner(1).unwrap().post_data(),
        vec![PostData {
            text: "user=page".to_string(),
            size: 9,
        }]
    );
}

#[test]
fn test_subresource_body_read_from_channel() {
    let (center, _observer, collector) = observer_with(ObserverConfig::default(), Some(form_page()));
    let channel = MockChannel::builder(2, "https://example.com/api/login")
        .method("POST")
        .post_text("user=wire")
        .build()
        .handle();

    post(&center, &channel);

    let post_data = collector.owner(2).unwrap().post_data();
    assert_eq!(post_data.len(), 1);
    assert_eq!(post_data[0].text, "user=wire");
}

#[test]
fn test_page_body_unused_without_channel_body() {
    let (center, _observer, collector) = observer_with(ObserverConfig::default(), Some(form_page()));
    let channel = MockChannel::get(3, "https://example.com/login");

    post(&center, &channel);

    assert!(collector.owner(3).unwrap().post_data().is_empty());
}

#[test]
fn test_request_body_limit_counts_characters() {
    let config = ObserverConfig::builder().request_body_limit(4).build();
    let (center, _observer, collector) = observer_with(config, None);
    let channel = MockChannel::builder(4, "https://example.com/submit")
        .method("POST")
        .post_text("ééééé")
        .build()
        .handle();

    post(&center, &channel);

    assert_eq!(
        collector.owner(4).unwrap().post_data(),
        vec![PostData {
            text: "éééé".to_string(),
            size: 5,
        }]
    );
}

#[test]
fn test_content_process_records_stay_bounded() {
    let config = ObserverConfig::builder()
        .process_type(ProcessType::Content)
        .max_tracked_channels(2)
        .completed_record_ttl(Duration::ZERO)
        .build();
    let (center, observer, collector) = observer_with(config, None);

    for id in 10..20 {
        let channel = MockChannel::builder(id, &format!("https://tracker.example/{id}"))
            .blocked(BlockedReason::new("tracking"))
            .build();
        center.publish(Notification::FailedOpeningRequest(channel.handle()));
        // No stop-request reaches a content process observer
        assert!(observer.tracked_channels() <= 2);
    }

    assert_eq!(collector.len(), 10);
    assert!(observer.tracked_channels() > 0);
    observer.evict_expired();
    assert_eq!(observer.tracked_channels(), 0);
}

#[test]
fn test_evict_expired_keeps_recent_records() {
    let (center, observer, _collector) = observer_with(ObserverConfig::default(), None);
    let channel = MockChannel::get(30, "https://example.com/slow");
    center.publish(activity(&channel, ActivitySubtype::RequestHeader, 0));

    assert_eq!(observer.evict_expired(), 0);
    assert_eq!(observer.tracked_channels(), 1);
}

#[test]
fn test_response_without_headers_is_skipped() {
    let (center, observer, collector) = observer_with(ObserverConfig::default(), None);
    let channel = MockChannel::get(40, "https://example.com/aborted");

    center.publish(Notification::ExamineResponse(channel.clone()));
    center.publish(Notification::ExamineCachedResponse(channel));

    assert!(collector.is_empty());
    assert_eq!(observer.tracked_channels(), 0);
}
