pub mod connection;
pub mod liveness;

pub use connection::LinkPhase;
pub use liveness::{ConnectionMonitor, Liveness, MonitorEvent, Thresholds};
