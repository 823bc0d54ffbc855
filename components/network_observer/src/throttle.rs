//! Network throttling
//!
//! Download throttling splices a [`ThrottleListener`] in front of a
//! channel's response listener. Received bytes are buffered and released by
//! a shared [`ThrottleQueue`] at a randomized rate, after a randomized
//! latency. Download-side activity notifications are held back by the
//! listener and re-emitted, with fresh timestamps, once the consumer has
//! actually been handed the corresponding bytes.
//!
//! Upload throttling is delegated to the platform through
//! [`HttpChannel::set_upload_throttle`].

use crate::activity::{now_micros, ActivityEvent, ActivitySubtype};
use crate::channel::{ChannelStatus, HttpChannel, StreamListener, UploadThrottle};
use har_types::ChannelError;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Length of the bandwidth accounting window
const WINDOW: Duration = Duration::from_secs(1);

/// Shortest delay before the queue pumps again
const MIN_PUMP_DELAY: Duration = Duration::from_millis(1);

/// Throttling profile
///
/// Latencies are milliseconds, bandwidths bytes per second. A direction with
/// both its mean and max at zero is not throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThrottleData {
    #[serde(rename = "latencyMean", default)]
    pub latency_mean: u64,
    #[serde(rename = "latencyMax", default)]
    pub latency_max: u64,
    #[serde(rename = "downloadBPSMean", default)]
    pub download_bps_mean: u64,
    #[serde(rename = "downloadBPSMax", default)]
    pub download_bps_max: u64,
    #[serde(rename = "uploadBPSMean", default)]
    pub upload_bps_mean: u64,
    #[serde(rename = "uploadBPSMax", default)]
    pub upload_bps_max: u64,
}

/// Uniform value around `mean`, never above `max`
///
/// Returns `mean` when `max` does not exceed it. Values beyond `i64::MAX` are clamped.
pub fn random_around(mean: u64, max: u64) -> i64 {
    let mean = i64::try_from(mean).unwrap_or(i64::MAX);
    let max = i64::try_from(max).unwrap_or(i64::MAX);
    if max <= mean {
        return mean;
    }
    let spread = max - mean;
    let offset = rand::thread_rng().gen_range(0..spread.saturating_mul(2));
    (mean - spread).saturating_add(offset).min(max)
}

/// Deferred delivery of one activity notification
pub type ActivityCallback = Box<dyn FnOnce(ActivityEvent) + Send>;

enum Pending {
    Data(Vec<u8>),
    Stop(ChannelStatus),
}

#[derive(Default)]
struct ListenerState {
    pending: VecDeque<Pending>,
    pending_error: Option<ChannelError>,
    offset: u64,
    response_started: bool,
    total_size: Option<u64>,
    activities: HashMap<ActivitySubtype, (ActivityEvent, ActivityCallback)>,
}

/// Per-channel buffer between the network and the real response listener
pub struct ThrottleListener {
    queue: Arc<ThrottleQueue>,
    state: Mutex<ListenerState>,
    downstream: Mutex<Option<Box<dyn StreamListener>>>,
}

impl ThrottleListener {
    pub fn new(queue: Arc<ThrottleQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            state: Mutex::new(ListenerState::default()),
            downstream: Mutex::new(None),
        })
    }

    /// Install the listener that receives released data
    pub fn set_original_listener(&self, listener: Box<dyn StreamListener>) {
        *self.downstream.lock() = Some(listener);
    }

    /// Number of queued chunks, the stop marker included
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Bytes released to the downstream listener so far
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// Hold back a download activity until the consumer catches up
    ///
    /// A later callback for the same subtype replaces an earlier one.
    pub fn add_activity_callback(&self, event: ActivityEvent, callback: ActivityCallback) {
        {
            let mut state = self.state.lock();
            if event.subtype == ActivitySubtype::ResponseComplete {
                state.total_size = Some(event.extra_size_data);
            }
            state.activities.insert(event.subtype, (event, callback));
        }
        self.maybe_emit_events();
    }

    /// Latency elapsed, response start may now be reported
    pub fn response_start(&self) {
        self.state.lock().response_started = true;
        self.maybe_emit_events();
    }

    /// Release at most `permitted` bytes of the oldest chunk
    ///
    /// # Returns
    /// Bytes released, and whether the oldest chunk was fully consumed
    pub fn send_some_data(&self, permitted: u64) -> (u64, bool) {
        let (released, done) = {
            let mut state = self.state.lock();
            match state.pending.front_mut() {
                None => return (0, true),
                Some(Pending::Data(bytes)) => {
                    let count = usize::try_from(permitted).map_or(bytes.len(), |p| p.min(bytes.len()));
                    let chunk: Vec<u8> = bytes.drain(..count).collect();
                    let done = bytes.is_empty();
                    if done {
                        state.pending.pop_front();
                    }
                    state.offset += count as u64;
                    (Pending::Data(chunk), done)
                }
                Some(Pending::Stop(_)) => match state.pending.pop_front() {
                    Some(stop) => (stop, true),
                    None => return (0, true),
                },
            }
        };

        match released {
            Pending::Stop(status) => {
                if let Some(listener) = self.downstream.lock().as_mut() {
                    listener.on_stop_request(status);
                }
                (0, true)
            }
            Pending::Data(chunk) => {
                if let Some(listener) = self.downstream.lock().as_mut() {
                    if let Err(e) = listener.on_data_available(&chunk) {
                        debug!("Throttled listener rejected data: {}", e);
                        self.state.lock().pending_error = Some(e);
                    }
                }
                self.maybe_emit_events();
                (chunk.len() as u64, done)
            }
        }
    }

    fn maybe_emit_events(&self) {
        let ready: Vec<(ActivityEvent, ActivityCallback)> = {
            let mut state = self.state.lock();
            let mut subtypes = Vec::new();
            if state.response_started {
                subtypes.extend([ActivitySubtype::ResponseStart, ActivitySubtype::ResponseHeader]);
            }
            // Completion never overtakes the response start
            if state.response_started
                && matches!(state.total_size, Some(total) if state.offset >= total)
            {
                subtypes.extend([
                    ActivitySubtype::ResponseComplete,
                    ActivitySubtype::TransactionClose,
                ]);
            }
            subtypes
                .into_iter()
                .filter_map(|subtype| state.activities.remove(&subtype))
                .collect()
        };

        for (mut event, callback) in ready {
            trace!("Releasing throttled activity {}", event.type_string());
            event.timestamp = now_micros();
            callback(event);
        }
    }

    fn push(self: &Arc<Self>, item: Pending) {
        self.state.lock().pending.push_back(item);
        self.queue.data_available(self);
    }
}

/// The listener as spliced into a channel's listener chain
pub struct ThrottledStream {
    listener: Arc<ThrottleListener>,
}

impl ThrottledStream {
    pub fn new(listener: Arc<ThrottleListener>) -> Self {
        Self { listener }
    }
}

impl StreamListener for ThrottledStream {
    fn on_start_request(&mut self) {
        if let Some(downstream) = self.listener.downstream.lock().as_mut() {
            downstream.on_start_request();
        }
        self.listener.queue.start(&self.listener);
    }

    fn on_data_available(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if let Some(e) = self.listener.state.lock().pending_error.clone() {
            return Err(e);
        }
        self.listener.push(Pending::Data(data.to_vec()));
        Ok(())
    }

    fn on_stop_request(&mut self, status: ChannelStatus) {
        self.listener.push(Pending::Stop(status));
    }
}

#[derive(Default)]
struct QueueState {
    pending_requests: Vec<Arc<ThrottleListener>>,
    download_queue: VecDeque<Arc<ThrottleListener>>,
    previous_reads: VecDeque<(Instant, u64)>,
}

/// Shared download bandwidth budget
pub struct ThrottleQueue {
    mean_bps: u64,
    max_bps: u64,
    latency_mean: u64,
    latency_max: u64,
    state: Mutex<QueueState>,
    pumping: AtomicBool,
    this: Weak<ThrottleQueue>,
}

impl ThrottleQueue {
    pub fn new(mean_bps: u64, max_bps: u64, latency_mean: u64, latency_max: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            mean_bps,
            max_bps,
            latency_mean,
            latency_max,
            state: Mutex::new(QueueState::default()),
            pumping: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Response started; release data after the simulated latency
    pub fn start(&self, listener: &Arc<ThrottleListener>) {
        self.state.lock().pending_requests.push(listener.clone());

        let delay = random_around(self.latency_mean, self.latency_max);
        if delay > 0 {
            let listener = Arc::downgrade(listener);
            self.schedule(Duration::from_millis(delay as u64), move |queue| {
                if let Some(listener) = listener.upgrade() {
                    queue.allow_data_from(&listener);
                }
            });
        } else {
            self.allow_data_from(listener);
        }
    }

    /// New data is buffered on `listener`
    pub fn data_available(&self, listener: &Arc<ThrottleListener>) {
        {
            let mut state = self.state.lock();
            if state
                .pending_requests
                .iter()
                .any(|pending| Arc::ptr_eq(pending, listener))
            {
                return;
            }
            state.download_queue.push_back(listener.clone());
        }
        self.pump();
    }

    fn allow_data_from(&self, listener: &Arc<ThrottleListener>) {
        listener.response_start();
        {
            let mut state = self.state.lock();
            state
                .pending_requests
                .retain(|pending| !Arc::ptr_eq(pending, listener));
            for _ in 0..listener.pending_count() {
                state.download_queue.push_back(listener.clone());
            }
        }
        self.pump();
    }

    fn pump(&self) {
        // A redirect can chain two throttled listeners, re-entering here
        if self.pumping.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = Instant::now();
        let mut budget = {
            let mut state = self.state.lock();
            while state
                .previous_reads
                .front()
                .is_some_and(|(when, _)| *when + WINDOW <= now)
            {
                state.previous_reads.pop_front();
            }
            let recent = state
                .previous_reads
                .iter()
                .fold(0u64, |sum, (_, bytes)| sum.saturating_add(*bytes));
            random_around(self.mean_bps, self.max_bps)
                .saturating_sub(i64::try_from(recent).unwrap_or(i64::MAX))
        };

        if budget > 0 {
            let mut read = 0u64;
            while budget > 0 {
                let Some(listener) = self.state.lock().download_queue.front().cloned() else {
                    break;
                };
                let (length, done) = listener.send_some_data(budget.unsigned_abs());
                budget = budget.saturating_sub(i64::try_from(length).unwrap_or(i64::MAX));
                read = read.saturating_add(length);
                if done {
                    self.state.lock().download_queue.pop_front();
                }
            }
            trace!("Throttle queue released {} bytes", read);
            self.state.lock().previous_reads.push_back((now, read));
        }

        let next = {
            let state = self.state.lock();
            if state.download_queue.is_empty() {
                None
            } else {
                let when = state
                    .previous_reads
                    .front()
                    .map_or(now + WINDOW, |(when, _)| *when + WINDOW);
                Some(when.saturating_duration_since(now).max(MIN_PUMP_DELAY))
            }
        };

        self.pumping.store(false, Ordering::Release);

        if let Some(delay) = next {
            self.schedule(delay, |queue| queue.pump());
        }
    }

    fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(Arc<ThrottleQueue>) + Send + 'static,
    {
        let queue = self.this.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(queue) = queue.upgrade() {
                        task(queue);
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    if let Some(queue) = queue.upgrade() {
                        task(queue);
                    }
                });
            }
        }
    }
}

/// Applies a [`ThrottleData`] profile to channels
pub struct ThrottleManager {
    download_queue: Option<Arc<ThrottleQueue>>,
    upload: Option<UploadThrottle>,
}

impl ThrottleManager {
    pub fn new(data: &ThrottleData) -> Self {
        let download_queue = (data.download_bps_max > 0 || data.download_bps_mean > 0).then(|| {
            ThrottleQueue::new(
                data.download_bps_mean,
                data.download_bps_max,
                data.latency_mean,
                data.latency_max,
            )
        });
        let upload = (data.upload_bps_max > 0 || data.upload_bps_mean > 0).then_some(UploadThrottle {
            mean_bps: data.upload_bps_mean,
            max_bps: data.upload_bps_max,
        });

        Self {
            download_queue,
            upload,
        }
    }

    pub fn throttles_download(&self) -> bool {
        self.download_queue.is_some()
    }

    pub fn throttles_upload(&self) -> bool {
        self.upload.is_some()
    }

    /// Splice a download throttle into the channel's response listener chain
    pub fn manage(&self, channel: &dyn HttpChannel) -> Option<Arc<ThrottleListener>> {
        let queue = self.download_queue.as_ref()?;
        let listener = ThrottleListener::new(queue.clone());

        let spliced = listener.clone();
        let wrap = Box::new(move |original: Box<dyn StreamListener>| {
            spliced.set_original_listener(original);
            Box::new(ThrottledStream::new(spliced)) as Box<dyn StreamListener>
        });

        match channel.set_new_listener(wrap) {
            Ok(()) => Some(listener),
            Err(e) => {
                debug!("Cannot throttle channel {}: {}", channel.channel_id(), e);
                None
            }
        }
    }

    /// Install the upload bandwidth limit on the channel
    pub fn manage_upload(&self, channel: &dyn HttpChannel) {
        let Some(upload) = self.upload else {
            return;
        };
        if let Err(e) = channel.set_upload_throttle(upload) {
            debug!("Cannot throttle upload of channel {}: {}", channel.channel_id(), e);
        }
    }
}
