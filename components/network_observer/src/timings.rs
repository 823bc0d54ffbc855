//! HAR timing reconstruction
//!
//! Converts the raw per-phase timestamps of an activity record into the HAR
//! buckets, their render offsets and a total. Everything here is pure: the
//! same phase map and timed-channel snapshot always produce the same result.
//!
//! All inputs are microseconds; all outputs are milliseconds.

use crate::activity::{ActivitySubtype as Phase, PhaseSpan, PhaseTimings};
use crate::channel::TimedChannelInfo;
use har_types::{HarOffsets, HarPhase, HarTimingResult, HarTimings, NOT_OBSERVED};

/// Convert a microsecond delta to milliseconds
///
/// Rounds half up and never goes below the `-1` sentinel.
pub fn to_ms(micros: i64) -> i64 {
    (micros + 500).div_euclid(1000).max(NOT_OBSERVED)
}

/// Convert a bucket duration, passing the not-observed sentinel through
pub fn bucket_ms(micros: i64) -> i64 {
    if micros == NOT_OBSERVED {
        NOT_OBSERVED
    } else {
        to_ms(micros)
    }
}

fn span(timings: &PhaseTimings, phase: Phase) -> Option<PhaseSpan> {
    timings.get(phase)
}

fn duration(start: Option<PhaseSpan>, end: Option<PhaseSpan>) -> i64 {
    match (start, end) {
        (Some(start), Some(end)) => end.last - start.first,
        _ => NOT_OBSERVED,
    }
}

fn blocked_timing(timings: &PhaseTimings) -> i64 {
    let Some(header) = span(timings, Phase::RequestHeader) else {
        return NOT_OBSERVED;
    };

    [Phase::StatusResolving, Phase::StatusSendingTo]
        .into_iter()
        .filter_map(|phase| span(timings, phase).map(|s| s.first))
        .min()
        .map_or(NOT_OBSERVED, |start| start - header.first)
}

fn send_timing(timings: &PhaseTimings) -> i64 {
    let body_sent = span(timings, Phase::RequestBodySent);

    if let Some(sending) = span(timings, Phase::StatusSendingTo) {
        let end = match body_sent {
            Some(body) if body.last >= sending.first => sending.last.max(body.last),
            _ => sending.last,
        };
        return end - sending.first;
    }

    duration(span(timings, Phase::RequestHeader), body_sent)
}

/// Time between the end of the upload and the first response byte
pub fn wait_timing(timings: &PhaseTimings) -> i64 {
    let Some(response) = span(timings, Phase::ResponseStart) else {
        return NOT_OBSERVED;
    };

    [Phase::RequestBodySent, Phase::StatusSendingTo]
        .into_iter()
        .filter_map(|phase| span(timings, phase).map(|s| s.last))
        .max()
        .map_or(NOT_OBSERVED, |sent| response.first - sent)
}

/// Start of the TLS handshake relative to connection start, when known
fn secure_connection_start(timings: &PhaseTimings) -> Option<i64> {
    let tls_start = span(timings, Phase::StatusTlsStarting)?;
    span(timings, Phase::StatusTlsEnding)?;

    let relative = span(timings, Phase::StatusConnectingTo)
        .map_or(0, |connecting| tls_start.first - connecting.first);
    Some(relative.max(0))
}

/// Start of sending relative to connection start, when known
fn start_sending(timings: &PhaseTimings, connect_start_tc: i64) -> Option<i64> {
    let sending = span(timings, Phase::StatusSendingTo)?;

    let relative = if let Some(connecting) = span(timings, Phase::StatusConnectingTo) {
        sending.first - connecting.first
    } else if connect_start_tc != 0 {
        sending.first - connect_start_tc
    } else {
        return None;
    };
    Some(relative.max(0))
}

/// Reconstruct the HAR timings of one request
///
/// `timed` is the channel's own timestamp record. It backfills `connect`,
/// `ssl` and `dns` when the activity stream missed them, which happens with
/// TCP fast open, TLS early data, or when connection events were attributed
/// to a speculative channel.
pub fn reconstruct(
    timings: &PhaseTimings,
    timed: Option<&TimedChannelInfo>,
    from_cache: bool,
) -> HarTimingResult {
    if from_cache {
        return HarTimingResult::cached();
    }

    let tc = timed.map(TimedChannelInfo::sanitized).unwrap_or_default();

    let mut raw = HarTimings {
        blocked: blocked_timing(timings),
        dns: duration(
            span(timings, Phase::StatusResolving),
            span(timings, Phase::StatusResolved),
        ),
        connect: duration(
            span(timings, Phase::StatusConnectingTo),
            span(timings, Phase::StatusConnectedTo),
        ),
        ssl: duration(
            span(timings, Phase::StatusTlsStarting),
            span(timings, Phase::StatusTlsEnding),
        ),
        send: send_timing(timings),
        wait: wait_timing(timings),
        receive: duration(
            span(timings, Phase::ResponseStart),
            span(timings, Phase::ResponseComplete),
        ),
    };

    let mut ssl_start = secure_connection_start(timings);

    if raw.connect <= 0 && tc.tcp_connect_end_time != 0 && tc.connect_start_time != 0 {
        raw.connect = tc.tcp_connect_end_time - tc.connect_start_time;
        if tc.secure_connection_start_time != 0 {
            raw.ssl = tc.connect_end_time - tc.secure_connection_start_time;
            ssl_start = Some(tc.secure_connection_start_time - tc.connect_start_time);
        } else {
            raw.ssl = NOT_OBSERVED;
        }
    } else if let Some(tls_start) = span(timings, Phase::StatusTlsStarting) {
        // Fast open that did not actually carry data: the timed channel holds
        // the corrected handshake start.
        if tc.secure_connection_start_time != 0 && tc.secure_connection_start_time > tls_start.first
        {
            raw.ssl = tc.connect_end_time - tc.secure_connection_start_time;
            ssl_start = None;
        }
    }

    if raw.dns <= 0 && tc.domain_lookup_end_time != 0 && tc.domain_lookup_start_time != 0 {
        raw.dns = tc.domain_lookup_end_time - tc.domain_lookup_start_time;
    }

    let send_start = start_sending(timings, tc.connect_start_time).map(|t| to_ms(t).max(0));
    let ssl_start = ssl_start.map(|t| to_ms(t).max(0));

    let mut result = HarTimings::unobserved();
    for (phase, value) in raw.iter() {
        result.set(phase, bucket_ms(value));
    }

    HarTimingResult {
        total: total_time(&result, ssl_start, send_start),
        timings: result,
        offsets: offsets(&result, ssl_start, send_start),
    }
}

fn total_time(timings: &HarTimings, ssl_start: Option<i64>, send_start: Option<i64>) -> i64 {
    // connect and ssl overlap with the relative send or ssl start
    let mut total: i64 = timings
        .iter()
        .filter(|(phase, value)| {
            *value > NOT_OBSERVED && !matches!(phase, HarPhase::Connect | HarPhase::Ssl)
        })
        .map(|(_, value)| value)
        .sum();

    if let Some(send_start) = send_start {
        total += send_start;
    } else if let Some(ssl_start) = ssl_start {
        total += ssl_start + timings.ssl.max(0);
    }
    total
}

fn offsets(timings: &HarTimings, ssl_start: Option<i64>, send_start: Option<i64>) -> HarOffsets {
    let len = |value: i64| value.max(0);

    let mut offsets = HarOffsets::zeroed();
    offsets.dns = len(timings.blocked);
    offsets.connect = offsets.dns + len(timings.dns);
    offsets.ssl = match ssl_start {
        Some(start) => offsets.connect + start,
        None => offsets.connect + len(timings.connect),
    };
    match send_start {
        Some(start) => {
            offsets.send = offsets.connect + start;
            if ssl_start.is_none() {
                offsets.ssl = (offsets.send - len(timings.ssl)).max(offsets.connect);
            } else if offsets.ssl > offsets.send {
                offsets.ssl = offsets.send;
            }
        }
        None => offsets.send = offsets.ssl + len(timings.ssl),
    }
    offsets.wait = offsets.send + len(timings.send);
    offsets.receive = offsets.wait + len(timings.wait);

    let mut floor = 0;
    for phase in HarPhase::ALL {
        let value = offsets.get(phase).max(floor);
        offsets.set(phase, value);
        floor = value;
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck::{quickcheck, TestResult};

    const MS: i64 = 1000;

    fn phases(entries: &[(Phase, i64)]) -> PhaseTimings {
        let mut timings = PhaseTimings::new();
        for (phase, ms) in entries {
            timings.record(*phase, ms * MS);
        }
        timings
    }

    fn example_request() -> PhaseTimings {
        phases(&[
            (Phase::RequestHeader, 0),
            (Phase::StatusResolving, 0),
            (Phase::StatusResolved, 20),
            (Phase::StatusConnectingTo, 20),
            (Phase::StatusConnectedTo, 50),
            (Phase::StatusSendingTo, 55),
            (Phase::RequestBodySent, 60),
            (Phase::ResponseStart, 120),
            (Phase::ResponseComplete, 180),
        ])
    }

    #[test]
    fn test_to_ms_rounding() {
        assert_eq!(to_ms(0), 0);
        assert_eq!(to_ms(1_499), 1);
        assert_eq!(to_ms(1_500), 2);
        assert_eq!(to_ms(-500), 0);
        assert_eq!(to_ms(-1_000), -1);
        assert_eq!(to_ms(-5_000_000), -1);
    }

    #[test]
    fn test_bucket_ms_keeps_sentinel() {
        assert_eq!(bucket_ms(NOT_OBSERVED), NOT_OBSERVED);
        assert_eq!(bucket_ms(60_000), 60);
        assert_eq!(bucket_ms(0), 0);
    }

    #[test]
    fn test_full_request_timings() {
        let result = reconstruct(&example_request(), None, false);

        assert_eq!(
            result.timings,
            HarTimings {
                blocked: 0,
                dns: 20,
                connect: 30,
                ssl: -1,
                send: 5,
                wait: 60,
                receive: 60,
            }
        );
        assert_eq!(result.total, 180);
        assert_eq!(
            result.offsets,
            HarOffsets {
                blocked: 0,
                dns: 0,
                connect: 20,
                ssl: 55,
                send: 55,
                wait: 60,
                receive: 120,
            }
        );
    }

    #[test]
    fn test_cached_is_all_zero() {
        let result = reconstruct(&example_request(), None, true);
        assert_eq!(result, HarTimingResult::cached());
    }

    #[test]
    fn test_nothing_observed() {
        let result = reconstruct(&PhaseTimings::new(), None, false);
        assert_eq!(result.timings, HarTimings::unobserved());
        assert_eq!(result.total, 0);
        assert_eq!(result.offsets, HarOffsets::zeroed());
    }

    #[test]
    fn test_send_falls_back_to_header_and_body() {
        let timings = phases(&[
            (Phase::RequestHeader, 10),
            (Phase::RequestBodySent, 14),
            (Phase::ResponseStart, 30),
        ]);
        let result = reconstruct(&timings, None, false);

        assert_eq!(result.timings.send, 4);
        assert_eq!(result.timings.wait, 16);
        assert_eq!(result.timings.blocked, -1);
        assert_eq!(result.timings.receive, -1);
    }

    #[test]
    fn test_wait_uses_latest_upload_phase() {
        let timings = phases(&[
            (Phase::StatusSendingTo, 10),
            (Phase::StatusSendingTo, 25),
            (Phase::RequestBodySent, 20),
            (Phase::ResponseStart, 40),
        ]);
        assert_eq!(to_ms(wait_timing(&timings)), 15);
    }

    #[test]
    fn test_tls_offset_relative_to_connect() {
        let timings = phases(&[
            (Phase::RequestHeader, 0),
            (Phase::StatusResolving, 0),
            (Phase::StatusResolved, 10),
            (Phase::StatusConnectingTo, 10),
            (Phase::StatusConnectedTo, 20),
            (Phase::StatusTlsStarting, 20),
            (Phase::StatusTlsEnding, 40),
            (Phase::StatusSendingTo, 40),
            (Phase::ResponseStart, 50),
            (Phase::ResponseComplete, 60),
        ]);
        let result = reconstruct(&timings, None, false);

        assert_eq!(result.timings.ssl, 20);
        assert_eq!(result.offsets.ssl, 20);
        assert_eq!(result.offsets.send, 40);
        // blocked 0 + dns 10 + send 0 + wait 10 + receive 10 + relative send start 30
        assert_eq!(result.total, 60);
    }

    #[test]
    fn test_timed_channel_backfills_connect_and_dns() {
        let timings = phases(&[
            (Phase::RequestHeader, 0),
            (Phase::StatusSendingTo, 30),
            (Phase::ResponseStart, 50),
            (Phase::ResponseComplete, 70),
        ]);
        let timed = TimedChannelInfo {
            async_open_time: 1,
            domain_lookup_start_time: 2 * MS,
            domain_lookup_end_time: 7 * MS,
            connect_start_time: 10 * MS,
            tcp_connect_end_time: 18 * MS,
            secure_connection_start_time: 18 * MS,
            connect_end_time: 28 * MS,
        };
        let result = reconstruct(&timings, Some(&timed), false);

        assert_eq!(result.timings.dns, 5);
        assert_eq!(result.timings.connect, 8);
        assert_eq!(result.timings.ssl, 10);
        // sending starts 20ms after the timed connect start
        assert_eq!(result.offsets.send, result.offsets.connect + 20);
        assert_eq!(result.offsets.ssl, result.offsets.connect + 8);
    }

    #[test]
    fn test_timed_channel_stale_values_ignored() {
        let timings = phases(&[(Phase::RequestHeader, 0)]);
        let timed = TimedChannelInfo {
            async_open_time: 100 * MS,
            connect_start_time: 10 * MS,
            tcp_connect_end_time: 18 * MS,
            ..Default::default()
        };
        let result = reconstruct(&timings, Some(&timed), false);
        assert_eq!(result.timings.connect, -1);
    }

    fn all_phases() -> [Phase; 15] {
        [
            Phase::RequestHeader,
            Phase::RequestBodySent,
            Phase::ResponseStart,
            Phase::ResponseHeader,
            Phase::ResponseComplete,
            Phase::TransactionClose,
            Phase::StatusResolving,
            Phase::StatusResolved,
            Phase::StatusConnectingTo,
            Phase::StatusConnectedTo,
            Phase::StatusSendingTo,
            Phase::StatusWaitingFor,
            Phase::StatusReceivingFrom,
            Phase::StatusTlsStarting,
            Phase::StatusTlsEnding,
        ]
    }

    fn arbitrary_timings(entries: &[(u8, u32)]) -> PhaseTimings {
        let phases = all_phases();
        let mut timings = PhaseTimings::new();
        for (index, ts) in entries {
            let phase = phases[*index as usize % phases.len()];
            timings.record(phase, i64::from(*ts));
        }
        timings
    }

    quickcheck! {
        fn prop_buckets_never_below_sentinel(entries: Vec<(u8, u32)>) -> bool {
            let result = reconstruct(&arbitrary_timings(&entries), None, false);
            let all_valid = result.timings.iter().all(|(_, value)| value >= NOT_OBSERVED);
            all_valid
        }

        fn prop_offsets_monotonic(entries: Vec<(u8, u32)>) -> bool {
            let result = reconstruct(&arbitrary_timings(&entries), None, false);
            let offsets: Vec<i64> = result.offsets.iter().map(|(_, v)| v).collect();
            offsets[0] == 0
                && offsets.iter().all(|v| *v >= 0)
                && offsets.windows(2).all(|pair| pair[0] <= pair[1])
        }

        fn prop_cached_ignores_stray_phases(entries: Vec<(u8, u32)>) -> bool {
            reconstruct(&arbitrary_timings(&entries), None, true) == HarTimingResult::cached()
        }

        fn prop_ordered_total_is_wall_clock(steps: (u8, u8, u8, u8, u8, u8, u8)) -> TestResult {
            let (blocked, dns, connect, to_send, send, wait, receive) = steps;
            let mut at = 0i64;
            let mut entries = vec![(Phase::RequestHeader, at)];
            at += i64::from(blocked);
            entries.push((Phase::StatusResolving, at));
            at += i64::from(dns);
            entries.push((Phase::StatusResolved, at));
            entries.push((Phase::StatusConnectingTo, at));
            at += i64::from(connect);
            entries.push((Phase::StatusConnectedTo, at));
            at += i64::from(to_send);
            entries.push((Phase::StatusSendingTo, at));
            at += i64::from(send);
            entries.push((Phase::RequestBodySent, at));
            at += i64::from(wait);
            entries.push((Phase::ResponseStart, at));
            at += i64::from(receive);
            entries.push((Phase::ResponseComplete, at));

            let result = reconstruct(&phases(&entries), None, false);
            TestResult::from_bool(result.total == at && result.offsets.receive + result.timings.receive == at)
        }
    }
}
