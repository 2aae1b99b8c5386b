//! Four-timestamp clock offset estimation (NTP style).
//!
//! ```text
//!  initiator                responder
//!     T1  ── SYNC_PING ──►   T2  (receive)
//!     T4  ◄── SYNC_PONG ──   T3  (transmit)
//!
//!  round trip = (T4 - T1) - (T3 - T2)
//!  offset     = ((T2 - T1) + (T3 - T4)) / 2
//! ```
//!
//! `offset` added to the initiator's clock estimates the responder's clock.
//! The stamps come off the wire unchecked, so the arithmetic saturates
//! instead of overflowing; implausible values still yield a sample.

use crate::clock::SharedClock;
use crate::message::CommandType;
use crate::protocol::SyncMessage;

/// Result of one ping/pong exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub offset_millis: i64,
    pub round_trip_millis: i64,
}

impl SyncSample {
    pub fn compute(origin: i64, receive: i64, transmit: i64, local_now: i64) -> Self {
        let (t1, t2, t3, t4) = (
            i128::from(origin),
            i128::from(receive),
            i128::from(transmit),
            i128::from(local_now),
        );
        Self {
            round_trip_millis: clamp((t4 - t1) - (t3 - t2)),
            offset_millis: clamp(((t2 - t1) + (t3 - t4)) / 2),
        }
    }
}

fn clamp(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Build the SYNC_PONG for a received ping. `received_at` is the local
/// wall clock when the ping came off the wire; the transmit stamp is taken
/// as late as possible, here.
pub fn answer_ping(
    local_id: &str,
    ping: &SyncMessage,
    received_at: i64,
    clock: &SharedClock,
) -> SyncMessage {
    let transmit = clock.now_millis();
    SyncMessage::new(
        CommandType::SyncPong,
        local_id,
        transmit,
        ping.origin_timestamp,
        received_at,
        transmit,
    )
}

/// Clock sync state for one (coordinator, endpoint) pair.
#[derive(Debug, Clone)]
pub struct TimeSyncEngine {
    local_id: String,
    clock: SharedClock,
    last: Option<SyncSample>,
    last_sync_at: Option<i64>,
    samples: u64,
}

impl TimeSyncEngine {
    pub fn new(local_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            local_id: local_id.into(),
            clock,
            last: None,
            last_sync_at: None,
            samples: 0,
        }
    }

    /// A SYNC_PING stamped with the current local time as origin.
    pub fn create_ping(&self) -> SyncMessage {
        let now = self.clock.now_millis();
        SyncMessage::new(CommandType::SyncPing, &self.local_id, now, now, 0, 0)
    }

    /// Fold in a SYNC_PONG, using the current local time as T4.
    pub fn process_pong(&mut self, pong: &SyncMessage) -> SyncSample {
        let now = self.clock.now_millis();
        let sample = SyncSample::compute(
            pong.origin_timestamp,
            pong.receive_timestamp,
            pong.transmit_timestamp,
            now,
        );
        self.last = Some(sample);
        self.last_sync_at = Some(now);
        self.samples += 1;
        sample
    }

    /// Estimated remote-minus-local offset; 0 until the first sample.
    pub fn offset_millis(&self) -> i64 {
        self.last.map_or(0, |s| s.offset_millis)
    }

    pub fn round_trip_millis(&self) -> i64 {
        self.last.map_or(0, |s| s.round_trip_millis)
    }

    pub fn last_sample(&self) -> Option<SyncSample> {
        self.last
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    pub fn is_synchronized(&self) -> bool {
        self.last.is_some()
    }

    /// Map a local timestamp into the remote clock domain.
    pub fn local_to_remote(&self, local_millis: i64) -> i64 {
        local_millis.saturating_add(self.offset_millis())
    }

    /// Map a remote timestamp into the local clock domain.
    pub fn remote_to_local(&self, remote_millis: i64) -> i64 {
        remote_millis.saturating_sub(self.offset_millis())
    }

    /// Half the round trip: the bound on offset error for symmetric paths.
    pub fn estimated_error_millis(&self) -> i64 {
        self.round_trip_millis() / 2
    }

    pub fn is_accurate(&self, max_error_millis: i64) -> bool {
        self.is_synchronized() && self.estimated_error_millis() <= max_error_millis
    }

    /// True when never synced or the last sync is older than `interval_millis`.
    pub fn is_sync_needed(&self, interval_millis: i64) -> bool {
        match self.last_sync_at {
            Some(at) => self.clock.now_millis().saturating_sub(at) > interval_millis,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn reference_exchange() {
        let s = SyncSample::compute(1000, 1050, 1060, 1120);
        assert_eq!(s.round_trip_millis, 70);
        assert_eq!(s.offset_millis, 45);
    }

    #[test]
    fn offset_truncates_toward_zero() {
        // (10 + -13) / 2 = -1.5 -> -1
        let s = SyncSample::compute(0, 10, 10, 23);
        assert_eq!(s.offset_millis, -1);
    }

    #[test]
    fn negative_round_trip_is_accepted() {
        let s = SyncSample::compute(1000, 1000, 1200, 1100);
        assert_eq!(s.round_trip_millis, -100);
    }

    #[test]
    fn extreme_timestamps_saturate() {
        let s = SyncSample::compute(0, i64::MIN, i64::MAX, 0);
        assert_eq!(s.round_trip_millis, i64::MIN);
        assert_eq!(s.offset_millis, 0);

        let s = SyncSample::compute(i64::MIN, i64::MAX, i64::MAX, i64::MIN);
        assert_eq!(s.round_trip_millis, 0);
        assert_eq!(s.offset_millis, i64::MAX);
    }

    #[test]
    fn hostile_pong_still_produces_a_sample() {
        let mut engine = TimeSyncEngine::new("hub", Arc::new(ManualClock::new(1000)));
        let pong = SyncMessage::new(CommandType::SyncPong, "phone-a", 0, 0, i64::MIN, i64::MAX);
        let sample = engine.process_pong(&pong);
        assert_eq!(sample.round_trip_millis, i64::MIN);
        assert!(engine.is_synchronized());

        let pong = SyncMessage::new(CommandType::SyncPong, "phone-a", 0, i64::MIN, i64::MAX, i64::MAX);
        engine.process_pong(&pong);
        assert_eq!(engine.offset_millis(), i64::MAX);
        assert_eq!(engine.local_to_remote(5), i64::MAX);
        assert_eq!(engine.remote_to_local(-5), i64::MIN);
    }

    #[test]
    fn full_exchange_between_two_clocks() {
        let local = Arc::new(ManualClock::new(1000));
        let remote = Arc::new(ManualClock::new(1045));
        let local_clock: SharedClock = local.clone();
        let remote_clock: SharedClock = remote.clone();

        let mut engine = TimeSyncEngine::new("hub", local_clock);
        assert_eq!(engine.offset_millis(), 0);
        assert!(engine.is_sync_needed(30_000));

        let ping = engine.create_ping();
        assert_eq!(ping.kind, CommandType::SyncPing);
        assert_eq!(ping.origin_timestamp, 1000);

        // 5 ms on the wire, 10 ms of processing on the remote.
        remote.advance(5);
        let received_at = remote_clock.now_millis();
        remote.advance(10);
        let pong = answer_ping("phone-a", &ping, received_at, &remote_clock);
        assert_eq!(pong.kind, CommandType::SyncPong);
        assert_eq!(pong.sender_id, "phone-a");

        local.set(1000 + 5 + 10 + 5);
        let sample = engine.process_pong(&pong);
        assert_eq!(sample.round_trip_millis, 10);
        assert_eq!(sample.offset_millis, 45);
        assert_eq!(engine.sample_count(), 1);
        assert_eq!(engine.local_to_remote(2000), 2045);
        assert_eq!(engine.remote_to_local(2045), 2000);
        assert_eq!(engine.estimated_error_millis(), 5);
        assert!(engine.is_accurate(50));
        assert!(!engine.is_sync_needed(30_000));

        local.advance(30_001);
        assert!(engine.is_sync_needed(30_000));
    }

    #[test]
    fn unsynchronized_is_never_accurate() {
        let engine = TimeSyncEngine::new("hub", Arc::new(ManualClock::new(0)));
        assert!(!engine.is_accurate(1_000));
    }
}
