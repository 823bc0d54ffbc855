//! Response body capture
//!
//! A [`StreamListenerTee`] sits in front of the channel's listener chain. It
//! forwards every chunk unchanged and also writes it, one pipe segment at a
//! time, into a [`BodyPipe`] drained by the [`ResponseCapture`].

use crate::activity::{ActivityRecord, SharedRecord};
use crate::channel::{ChannelStatus, StreamListener};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use har_types::{ChannelError, ResponseContent};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Number of segments the pipe buffers before writers block
const PIPE_SEGMENTS: usize = 4;

#[derive(Debug, Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
}

/// Bounded in-memory byte pipe
///
/// Writers block while the pipe is full; readers never block.
#[derive(Debug)]
pub struct BodyPipe {
    segment_size: usize,
    capacity: usize,
    state: Mutex<PipeState>,
    drained: Condvar,
}

impl BodyPipe {
    pub fn new(segment_size: usize) -> Arc<Self> {
        let segment_size = segment_size.max(1);
        Arc::new(Self {
            segment_size,
            capacity: segment_size.saturating_mul(PIPE_SEGMENTS),
            state: Mutex::new(PipeState::default()),
            drained: Condvar::new(),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Write all of `data`, blocking while the pipe is full
    pub fn write(&self, mut data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        while !data.is_empty() {
            if state.closed {
                return Err(ChannelError::AlreadyFinished);
            }
            let room = self.capacity.saturating_sub(state.buffer.len());
            if room == 0 {
                self.drained.wait(&mut state);
                continue;
            }
            let count = room.min(data.len());
            state.buffer.extend(&data[..count]);
            data = &data[count..];
        }
        Ok(())
    }

    /// Take everything currently buffered
    pub fn read_available(&self) -> Vec<u8> {
        let mut state = self.state.lock();
        let bytes: Vec<u8> = state.buffer.drain(..).collect();
        self.drained.notify_all();
        bytes
    }

    pub fn available(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.drained.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Called once the capture has finished with its record
pub type CaptureComplete = Box<dyn FnOnce(&SharedRecord) + Send>;

/// Accumulates the response body of one request
pub struct ResponseCapture {
    record: Weak<Mutex<ActivityRecord>>,
    pipe: Arc<BodyPipe>,
    limit: usize,
    body: Vec<u8>,
    received: u64,
    truncated: bool,
    on_complete: Option<CaptureComplete>,
}

impl ResponseCapture {
    /// `limit` of zero captures without bound
    pub fn new(record: &SharedRecord, pipe: Arc<BodyPipe>, limit: usize) -> Self {
        Self {
            record: Arc::downgrade(record),
            pipe,
            limit,
            body: Vec::new(),
            received: 0,
            truncated: false,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, callback: CaptureComplete) -> Self {
        self.on_complete = Some(callback);
        self
    }

    fn drain_pipe(&mut self) {
        let bytes = self.pipe.read_available();
        self.received += bytes.len() as u64;

        if self.truncated {
            return;
        }
        let room = if self.limit == 0 {
            bytes.len()
        } else {
            self.limit.saturating_sub(self.body.len())
        };
        if bytes.len() > room {
            self.body.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.body.extend_from_slice(&bytes);
        }
    }

    fn content(&mut self, discarded: bool) -> ResponseContent {
        if discarded {
            return ResponseContent {
                body_size: self.received,
                discarded: true,
                ..Default::default()
            };
        }

        let body = std::mem::take(&mut self.body);
        let (text, base64_encoded) = match String::from_utf8(body) {
            Ok(text) => (text, false),
            Err(e) => (STANDARD.encode(e.into_bytes()), true),
        };
        ResponseContent {
            text: Some(text),
            base64_encoded,
            body_size: self.received,
            truncated: self.truncated,
            discarded: false,
        }
    }
}

impl StreamListener for ResponseCapture {
    fn on_data_available(&mut self, _data: &[u8]) -> Result<(), ChannelError> {
        self.drain_pipe();
        Ok(())
    }

    fn on_stop_request(&mut self, status: ChannelStatus) {
        self.drain_pipe();
        self.pipe.close();

        let Some(record) = self.record.upgrade() else {
            trace!("Response finished after its record was released");
            return;
        };

        let (owner, discarded) = {
            let mut record = record.lock();
            record.body_size = self.received;
            record.response_pending = false;
            (record.owner.clone(), record.discard_response_body)
        };

        if let Some(owner) = owner {
            debug!(
                "Response body complete: {} bytes, status {:?}",
                self.received, status
            );
            owner.add_response_content(self.content(discarded));
        }

        if let Some(callback) = self.on_complete.take() {
            callback(&record);
        }
    }
}

/// Forwards a response stream to the original listener and the body pipe
pub struct StreamListenerTee {
    original: Box<dyn StreamListener>,
    pipe: Arc<BodyPipe>,
    capture: ResponseCapture,
}

impl StreamListenerTee {
    pub fn new(
        original: Box<dyn StreamListener>,
        pipe: Arc<BodyPipe>,
        capture: ResponseCapture,
    ) -> Self {
        Self {
            original,
            pipe,
            capture,
        }
    }
}

impl StreamListener for StreamListenerTee {
    fn on_start_request(&mut self) {
        self.original.on_start_request();
        self.capture.on_start_request();
    }

    fn on_data_available(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let forwarded = self.original.on_data_available(data);

        if !self.pipe.is_closed() {
            for segment in data.chunks(self.pipe.segment_size()) {
                if let Err(e) = self.pipe.write(segment) {
                    debug!("Body pipe rejected data: {}", e);
                    break;
                }
                self.capture.on_data_available(segment)?;
            }
        }

        forwarded
    }

    fn on_stop_request(&mut self, status: ChannelStatus) {
        self.original.on_stop_request(status);
        self.capture.on_stop_request(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::NetworkEventOwner;
    use crate::test_support::{MockChannel, MockOwner, RecordingListener};
    use pretty_assertions::assert_eq;

    fn record_with_owner(owner: &Arc<MockOwner>) -> SharedRecord {
        let mut record = ActivityRecord::new(1, MockChannel::get(1, "https://example.com/"), true);
        record.owner = Some(owner.clone() as Arc<dyn NetworkEventOwner>);
        Arc::new(Mutex::new(record))
    }

    fn make_tee(
        record: &SharedRecord,
        segment: usize,
        limit: usize,
    ) -> (StreamListenerTee, RecordingListener) {
        let recorder = RecordingListener::default();
        let pipe = BodyPipe::new(segment);
        let capture = ResponseCapture::new(record, pipe.clone(), limit);
        (
            StreamListenerTee::new(Box::new(recorder.clone()), pipe, capture),
            recorder,
        )
    }

    #[test]
    fn test_pipe_write_read() {
        let pipe = BodyPipe::new(4);
        pipe.write(b"hello").unwrap();
        assert_eq!(pipe.available(), 5);
        assert_eq!(pipe.read_available(), b"hello".to_vec());
        assert_eq!(pipe.available(), 0);

        pipe.close();
        assert_eq!(pipe.write(b"x"), Err(ChannelError::AlreadyFinished));
    }

    #[test]
    fn test_pipe_huge_segment_size() {
        let pipe = BodyPipe::new(usize::MAX);
        pipe.write(b"abc").unwrap();
        assert_eq!(pipe.read_available(), b"abc".to_vec());
    }

    #[test]
    fn test_pipe_blocks_until_drained() {
        let pipe = BodyPipe::new(2);
        let writer = {
            let pipe = pipe.clone();
            std::thread::spawn(move || pipe.write(&[0u8; 20]))
        };

        let mut read = 0;
        while read < 20 {
            read += pipe.read_available().len();
            std::thread::yield_now();
        }
        assert!(writer.join().unwrap().is_ok());
    }

    #[test]
    fn test_tee_forwards_and_captures() {
        let owner = MockOwner::new();
        let record = record_with_owner(&owner);
        let (mut tee, recorder) = make_tee(&record, 4, 0);

        tee.on_start_request();
        tee.on_data_available(b"hello ").unwrap();
        tee.on_data_available(b"world").unwrap();
        tee.on_stop_request(ChannelStatus::Success);

        assert_eq!(recorder.received(), b"hello world".to_vec());
        assert_eq!(recorder.stopped(), Some(ChannelStatus::Success));
        assert_eq!(record.lock().body_size(), 11);
        assert_eq!(
            owner.response_content(),
            Some(ResponseContent {
                text: Some("hello world".to_string()),
                base64_encoded: false,
                body_size: 11,
                truncated: false,
                discarded: false,
            })
        );
    }

    #[test]
    fn test_capture_truncates_at_limit() {
        let owner = MockOwner::new();
        let record = record_with_owner(&owner);
        let (mut tee, recorder) = make_tee(&record, 3, 5);

        tee.on_data_available(b"0123456789").unwrap();
        tee.on_stop_request(ChannelStatus::Success);

        assert_eq!(recorder.received().len(), 10);
        let content = owner.response_content().unwrap();
        assert_eq!(content.text.as_deref(), Some("01234"));
        assert!(content.truncated);
        assert_eq!(content.body_size, 10);
    }

    #[test]
    fn test_binary_body_is_base64() {
        let owner = MockOwner::new();
        let record = record_with_owner(&owner);
        let (mut tee, _recorder) = make_tee(&record, 16, 0);

        tee.on_data_available(&[0xff, 0xfe, 0x00]).unwrap();
        tee.on_stop_request(ChannelStatus::Success);

        let content = owner.response_content().unwrap();
        assert!(content.base64_encoded);
        assert_eq!(content.text.as_deref(), Some("//4A"));
    }

    #[test]
    fn test_discarded_body_not_sent() {
        let owner = MockOwner::new();
        let record = record_with_owner(&owner);
        record.lock().discard_response_body = true;
        let (mut tee, _recorder) = make_tee(&record, 16, 0);

        tee.on_data_available(b"secret").unwrap();
        tee.on_stop_request(ChannelStatus::Success);

        let content = owner.response_content().unwrap();
        assert!(content.discarded);
        assert_eq!(content.text, None);
        assert_eq!(content.body_size, 6);
    }

    #[test]
    fn test_released_record_is_ignored() {
        let owner = MockOwner::new();
        let record = record_with_owner(&owner);
        let (mut tee, _recorder) = make_tee(&record, 16, 0);
        drop(record);

        tee.on_data_available(b"late").unwrap();
        tee.on_stop_request(ChannelStatus::Success);
        assert_eq!(owner.response_content(), None);
    }
}
