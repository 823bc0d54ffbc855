// HAR timing types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for a timing bucket that was not observed
pub const NOT_OBSERVED: i64 = -1;

/// HAR timing bucket, in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarPhase {
    Blocked,
    Dns,
    Connect,
    Ssl,
    Send,
    Wait,
    Receive,
}

impl HarPhase {
    /// All buckets in canonical order
    pub const ALL: [HarPhase; 7] = [
        HarPhase::Blocked,
        HarPhase::Dns,
        HarPhase::Connect,
        HarPhase::Ssl,
        HarPhase::Send,
        HarPhase::Wait,
        HarPhase::Receive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HarPhase::Blocked => "blocked",
            HarPhase::Dns => "dns",
            HarPhase::Connect => "connect",
            HarPhase::Ssl => "ssl",
            HarPhase::Send => "send",
            HarPhase::Wait => "wait",
            HarPhase::Receive => "receive",
        }
    }
}

impl fmt::Display for HarPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Millisecond values for each HAR bucket
///
/// Used both for durations (where [`NOT_OBSERVED`] marks a missing phase)
/// and for offsets (always `>= 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HarTimings {
    pub blocked: i64,
    pub dns: i64,
    pub connect: i64,
    pub ssl: i64,
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
}

/// Start offsets of each bucket relative to request start
pub type HarOffsets = HarTimings;

impl HarTimings {
    /// All buckets zero
    pub const fn zeroed() -> Self {
        Self {
            blocked: 0,
            dns: 0,
            connect: 0,
            ssl: 0,
            send: 0,
            wait: 0,
            receive: 0,
        }
    }

    /// All buckets marked as not observed
    pub const fn unobserved() -> Self {
        Self {
            blocked: NOT_OBSERVED,
            dns: NOT_OBSERVED,
            connect: NOT_OBSERVED,
            ssl: NOT_OBSERVED,
            send: NOT_OBSERVED,
            wait: NOT_OBSERVED,
            receive: NOT_OBSERVED,
        }
    }

    pub fn get(&self, phase: HarPhase) -> i64 {
        match phase {
            HarPhase::Blocked => self.blocked,
            HarPhase::Dns => self.dns,
            HarPhase::Connect => self.connect,
            HarPhase::Ssl => self.ssl,
            HarPhase::Send => self.send,
            HarPhase::Wait => self.wait,
            HarPhase::Receive => self.receive,
        }
    }

    pub fn set(&mut self, phase: HarPhase, value: i64) {
        match phase {
            HarPhase::Blocked => self.blocked = value,
            HarPhase::Dns => self.dns = value,
            HarPhase::Connect => self.connect = value,
            HarPhase::Ssl => self.ssl = value,
            HarPhase::Send => self.send = value,
            HarPhase::Wait => self.wait = value,
            HarPhase::Receive => self.receive = value,
        }
    }

    /// Iterate `(phase, value)` pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (HarPhase, i64)> + '_ {
        HarPhase::ALL.iter().map(move |phase| (*phase, self.get(*phase)))
    }
}

/// Final timing record for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarTimingResult {
    /// Total time in milliseconds, with overlapping phases counted once
    pub total: i64,
    /// Duration of each bucket
    pub timings: HarTimings,
    /// Start position of each bucket
    pub offsets: HarOffsets,
}

impl HarTimingResult {
    /// Result for a response served entirely from cache
    pub const fn cached() -> Self {
        Self {
            total: 0,
            timings: HarTimings::zeroed(),
            offsets: HarTimings::zeroed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canonical_order() {
        let names: Vec<&str> = HarPhase::ALL.iter().map(HarPhase::as_str).collect();
        assert_eq!(
            names,
            vec!["blocked", "dns", "connect", "ssl", "send", "wait", "receive"]
        );
    }

    #[test]
    fn test_get_set() {
        let mut timings = HarTimings::unobserved();
        timings.set(HarPhase::Wait, 42);
        assert_eq!(timings.get(HarPhase::Wait), 42);
        assert_eq!(timings.get(HarPhase::Dns), NOT_OBSERVED);
        assert_eq!(timings.iter().filter(|(_, v)| *v == NOT_OBSERVED).count(), 6);
    }

    #[test]
    fn test_cached_result_serialization() {
        let json = serde_json::to_value(HarTimingResult::cached()).unwrap();
        assert_eq!(json["total"], 0);
        assert_eq!(json["timings"]["receive"], 0);
        assert_eq!(json["offsets"]["ssl"], 0);
    }
}
