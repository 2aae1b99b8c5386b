//! SYNC_MARKER events.
//!
//! A marker is broadcast to every endpoint during a recording; each endpoint
//! records when it arrived, both on its own clock and mapped into the
//! coordinator's clock. Comparing those receipts across endpoints shows how
//! well the recordings line up.
//!
//! Parameters on the wire: `[marker_id, marker_type, sender_millis]`.

use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;
use crate::message::CommandType;
use crate::protocol::CommandMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerType {
    StartRecording,
    StopRecording,
    Periodic,
    Manual,
    Calibration,
}

impl MarkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerType::StartRecording => "START_RECORDING",
            MarkerType::StopRecording => "STOP_RECORDING",
            MarkerType::Periodic => "PERIODIC",
            MarkerType::Manual => "MANUAL",
            MarkerType::Calibration => "CALIBRATION",
        }
    }
}

impl fmt::Display for MarkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "START_RECORDING" => Ok(MarkerType::StartRecording),
            "STOP_RECORDING" => Ok(MarkerType::StopRecording),
            "PERIODIC" => Ok(MarkerType::Periodic),
            "MANUAL" => Ok(MarkerType::Manual),
            "CALIBRATION" => Ok(MarkerType::Calibration),
            _ => Err(DecodeError::Malformed("unknown marker type")),
        }
    }
}

/// Receipt of one marker on one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEvent {
    pub marker_id: String,
    pub marker_type: MarkerType,
    /// Sender wall clock when the marker was created.
    pub sent_at: i64,
    /// Receiver wall clock at receipt.
    pub local_timestamp: i64,
    /// `local_timestamp` mapped into the coordinator clock; `None` when the
    /// receiver has never synced.
    pub coordinator_timestamp: Option<i64>,
    pub receiver_id: String,
}

/// `"{prefix}_{millis}"`.
pub fn generate_marker_id(prefix: &str, now_millis: i64) -> String {
    format!("{prefix}_{now_millis}")
}

pub fn create_marker_message(
    marker_id: impl Into<String>,
    marker_type: MarkerType,
    sender_id: &str,
    session_id: &str,
    now_millis: i64,
) -> CommandMessage {
    CommandMessage::new(
        CommandType::SyncMarker,
        sender_id,
        now_millis,
        session_id,
        vec![
            marker_id.into(),
            marker_type.as_str().to_string(),
            now_millis.to_string(),
        ],
    )
}

/// Record receipt of a marker. `offset_to_coordinator` maps the local clock
/// into the coordinator's (pass `None` when unsynchronized).
pub fn record_marker_event(
    message: &CommandMessage,
    receiver_id: &str,
    local_now: i64,
    offset_to_coordinator: Option<i64>,
) -> Result<MarkerEvent, DecodeError> {
    if message.kind != CommandType::SyncMarker {
        return Err(DecodeError::Malformed("not a sync marker"));
    }
    let [marker_id, marker_type, sent_at, ..] = message.parameters.as_slice() else {
        return Err(DecodeError::Malformed("sync marker needs three parameters"));
    };
    let marker_type = marker_type.parse::<MarkerType>()?;
    let sent_at = sent_at
        .parse::<i64>()
        .map_err(|_| DecodeError::Malformed("sync marker timestamp"))?;

    Ok(MarkerEvent {
        marker_id: marker_id.clone(),
        marker_type,
        sent_at,
        local_timestamp: local_now,
        coordinator_timestamp: offset_to_coordinator.map(|o| local_now.saturating_add(o)),
        receiver_id: receiver_id.to_string(),
    })
}

/// Difference between two receipts, preferring the coordinator clock
/// domain when both sides have it.
pub fn time_difference(a: &MarkerEvent, b: &MarkerEvent) -> i64 {
    match (a.coordinator_timestamp, b.coordinator_timestamp) {
        (Some(x), Some(y)) => x.saturating_sub(y),
        _ => a.local_timestamp.saturating_sub(b.local_timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_message_layout() {
        let id = generate_marker_id("start", 1_234);
        assert_eq!(id, "start_1234");

        let msg = create_marker_message(&id, MarkerType::StartRecording, "hub", "s1", 1_234);
        assert_eq!(msg.kind, CommandType::SyncMarker);
        assert_eq!(msg.session_id, "s1");
        assert_eq!(msg.parameters, vec!["start_1234", "START_RECORDING", "1234"]);
    }

    #[test]
    fn record_maps_into_coordinator_clock() {
        let msg = create_marker_message("m1", MarkerType::Manual, "hub", "s1", 500);
        let event = record_marker_event(&msg, "phone-a", 1_000, Some(-40)).unwrap();
        assert_eq!(event.marker_type, MarkerType::Manual);
        assert_eq!(event.sent_at, 500);
        assert_eq!(event.coordinator_timestamp, Some(960));
    }

    #[test]
    fn record_rejects_bad_markers() {
        let mut msg = create_marker_message("m1", MarkerType::Manual, "hub", "s1", 500);
        msg.parameters[1] = "SIDEWAYS".into();
        assert!(record_marker_event(&msg, "phone-a", 0, None).is_err());

        msg.parameters.truncate(1);
        assert!(record_marker_event(&msg, "phone-a", 0, None).is_err());
    }

    #[test]
    fn difference_prefers_coordinator_domain() {
        let msg = create_marker_message("m1", MarkerType::Periodic, "hub", "s1", 0);
        let a = record_marker_event(&msg, "a", 1_000, Some(10)).unwrap();
        let b = record_marker_event(&msg, "b", 1_100, Some(-95)).unwrap();
        assert_eq!(time_difference(&a, &b), 1_010 - 1_005);

        let c = record_marker_event(&msg, "c", 1_030, None).unwrap();
        assert_eq!(time_difference(&c, &a), 30);
    }
}
