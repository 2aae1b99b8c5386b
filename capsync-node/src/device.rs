//! Simulated capture hardware.
//!
//! Holds the battery/storage/stream state a real node would read from its
//! sensors and decides how to answer each hub command.

use capsync_core::{CommandMessage, CommandType, DeviceStatus, StatusCode};

use crate::config::DeviceConfig;

/// What to send back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: CommandType,
    pub status: StatusCode,
    pub message: String,
    pub data: Vec<String>,
}

impl Reply {
    fn ack(message: &str, data: Vec<String>) -> Self {
        Self {
            kind: CommandType::Ack,
            status: StatusCode::Ok,
            message: message.into(),
            data,
        }
    }

    fn nack(status: StatusCode, message: &str) -> Self {
        Self {
            kind: CommandType::Nack,
            status,
            message: message.into(),
            data: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedDevice {
    status: DeviceStatus,
    session: Option<String>,
}

impl SimulatedDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        let status = DeviceStatus {
            battery_level: Some(config.battery_level.clone()),
            storage_remaining: Some(config.storage_remaining.clone()),
            active_streams: config.streams.iter().map(|s| (s.clone(), false)).collect(),
            updated_at: 0,
        };
        Self {
            status,
            session: None,
        }
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Apply a hub command. `None` means the command needs no reply.
    pub fn handle(&mut self, command: &CommandMessage) -> Option<Reply> {
        match command.kind {
            CommandType::StatusQuery => Some(Reply {
                kind: CommandType::StatusQuery,
                status: StatusCode::Ok,
                message: "status".into(),
                data: self.status.to_data(),
            }),
            CommandType::Start => Some(self.start(&command.session_id)),
            CommandType::Stop => Some(self.stop()),
            _ => None,
        }
    }

    fn start(&mut self, session_id: &str) -> Reply {
        if let Some(current) = &self.session {
            return Reply::nack(
                StatusCode::ErrorBusy,
                &format!("already recording session {current}"),
            );
        }
        self.set_streams(true);
        self.session = Some(session_id.to_string());
        Reply::ack(
            "recording started",
            vec![CommandType::Start.to_string(), session_id.to_string()],
        )
    }

    fn stop(&mut self) -> Reply {
        let Some(session) = self.session.take() else {
            return Reply::nack(StatusCode::ErrorInvalidCommand, "not recording");
        };
        self.set_streams(false);
        Reply::ack("recording stopped", vec![CommandType::Stop.to_string(), session])
    }

    fn set_streams(&mut self, active: bool) {
        for flag in self.status.active_streams.values_mut() {
            *flag = active;
        }
    }
}
