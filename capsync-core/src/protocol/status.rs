//! Positional status payload carried by STATUS_QUERY responses.
//!
//! `data[0]` battery level, `data[1]` storage remaining, `data[2]` active
//! streams as comma-separated `name:bool` pairs.

use std::collections::BTreeMap;

use crate::message::CommandType;
use crate::protocol::ResponseMessage;

/// Last known battery/storage/stream state of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub battery_level: Option<String>,
    pub storage_remaining: Option<String>,
    pub active_streams: BTreeMap<String, bool>,
    /// Wall clock (ms) of the last applied report; 0 if none yet.
    pub updated_at: i64,
}

impl DeviceStatus {
    /// Apply a status report. Responses with fewer than three data items
    /// only bump `updated_at`.
    pub fn update_from_response(&mut self, response: &ResponseMessage, now_millis: i64) {
        if let [battery, storage, streams, ..] = response.data.as_slice() {
            self.battery_level = Some(battery.clone());
            self.storage_remaining = Some(storage.clone());
            self.active_streams = parse_streams(streams);
        }
        self.updated_at = now_millis;
    }

    pub fn is_stream_active(&self, name: &str) -> bool {
        self.active_streams.get(name).copied().unwrap_or(false)
    }

    /// Build the positional payload for a status report.
    pub fn to_data(&self) -> Vec<String> {
        vec![
            self.battery_level.clone().unwrap_or_default(),
            self.storage_remaining.clone().unwrap_or_default(),
            format_streams(&self.active_streams),
        ]
    }

    /// Whether a response is a status report this type understands.
    pub fn is_status_report(response: &ResponseMessage) -> bool {
        response.kind == CommandType::StatusQuery
    }
}

/// Parse `"gsr:true,rgb:false"`. Malformed pairs are skipped.
pub fn parse_streams(descriptor: &str) -> BTreeMap<String, bool> {
    descriptor
        .split(',')
        .filter_map(|pair| {
            let (name, flag) = pair.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), flag.trim().eq_ignore_ascii_case("true")))
        })
        .collect()
}

pub fn format_streams(streams: &BTreeMap<String, bool>) -> String {
    streams
        .iter()
        .map(|(name, active)| format!("{name}:{active}"))
        .collect::<Vec<_>>()
        .join(",")
}
