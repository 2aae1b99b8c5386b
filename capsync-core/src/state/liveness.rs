//! Heartbeat-based liveness classification.
//!
//! ```text
//!  Connected ──silence≥suspect──► Suspect ──silence≥lost──► Lost ──silence≥evict──► PermanentlyLost
//!      ▲                             │                       │                        (evicted)
//!      └──────── any inbound message ┴───────────────────────┘
//! ```
//!
//! The monitor never touches sockets and never reads the clock itself:
//! callers pass `now` into every method, which keeps it deterministic
//! under test. Transport-level disconnects are handled by the caller
//! unregistering the endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::TimingConfig;

/// Liveness classification of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    Connected,
    Suspect,
    Lost,
    /// Terminal; the endpoint is evicted in the same sweep.
    PermanentlyLost,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Connected => "CONNECTED",
            Liveness::Suspect => "SUSPECT",
            Liveness::Lost => "LOST",
            Liveness::PermanentlyLost => "PERMANENTLY_LOST",
        };
        f.write_str(s)
    }
}

/// A state change produced by [`ConnectionMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Suspect(String),
    /// The CONNECTED→LOST edge of a silent episode.
    Lost(String),
    Recovered(String),
    PermanentlyLost(String),
}

impl MonitorEvent {
    pub fn endpoint_id(&self) -> &str {
        match self {
            MonitorEvent::Suspect(id)
            | MonitorEvent::Lost(id)
            | MonitorEvent::Recovered(id)
            | MonitorEvent::PermanentlyLost(id) => id,
        }
    }
}

/// Silence thresholds, measured from the last inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub suspect_after: Duration,
    pub lost_after: Duration,
    pub evict_after: Duration,
}

impl From<&TimingConfig> for Thresholds {
    fn from(t: &TimingConfig) -> Self {
        Self {
            suspect_after: Duration::from_millis(t.suspect_after_ms),
            lost_after: Duration::from_millis(t.lost_after_ms),
            evict_after: Duration::from_millis(t.evict_after_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: Liveness,
    last_heard: Instant,
}

#[derive(Debug)]
pub struct ConnectionMonitor {
    thresholds: Thresholds,
    endpoints: BTreeMap<String, Tracked>,
}

impl ConnectionMonitor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Start tracking an endpoint as CONNECTED. Re-registering resets it.
    pub fn register(&mut self, id: &str, now: Instant) {
        self.endpoints.insert(
            id.to_string(),
            Tracked {
                state: Liveness::Connected,
                last_heard: now,
            },
        );
    }

    /// Stop tracking. Returns whether the endpoint was tracked.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.endpoints.remove(id).is_some()
    }

    /// Note inbound traffic. Returns `Recovered` when this ends a silent
    /// episode (SUSPECT or LOST). Unknown endpoints are ignored.
    pub fn record_activity(&mut self, id: &str, now: Instant) -> Option<MonitorEvent> {
        let tracked = self.endpoints.get_mut(id)?;
        tracked.last_heard = now;
        match tracked.state {
            Liveness::Suspect | Liveness::Lost => {
                tracked.state = Liveness::Connected;
                Some(MonitorEvent::Recovered(id.to_string()))
            }
            _ => None,
        }
    }

    /// Apply every forward transition due at `now`, in order. An endpoint
    /// silent past several thresholds yields each intermediate event.
    /// Permanently lost endpoints are evicted before this returns.
    pub fn sweep(&mut self, now: Instant) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        let mut evicted = Vec::new();

        for (id, tracked) in self.endpoints.iter_mut() {
            let silence = now.saturating_duration_since(tracked.last_heard);
            while let Some((next, event)) = self.thresholds.next_state(id, tracked.state, silence) {
                tracked.state = next;
                if next == Liveness::PermanentlyLost {
                    evicted.push(id.clone());
                }
                events.push(event);
            }
        }

        for id in evicted {
            self.endpoints.remove(&id);
        }
        events
    }

    pub fn state(&self, id: &str) -> Option<Liveness> {
        self.endpoints.get(id).map(|t| t.state)
    }

    pub fn last_heard(&self, id: &str) -> Option<Instant> {
        self.endpoints.get(id).map(|t| t.last_heard)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
    }
}

impl Thresholds {
    /// The forward step due for `id` after `silence`, with the event it
    /// produces.
    fn next_state(
        &self,
        id: &str,
        current: Liveness,
        silence: Duration,
    ) -> Option<(Liveness, MonitorEvent)> {
        match current {
            Liveness::Connected if silence >= self.suspect_after => {
                Some((Liveness::Suspect, MonitorEvent::Suspect(id.to_string())))
            }
            Liveness::Suspect if silence >= self.lost_after => {
                Some((Liveness::Lost, MonitorEvent::Lost(id.to_string())))
            }
            Liveness::Lost if silence >= self.evict_after => {
                Some((Liveness::PermanentlyLost, MonitorEvent::PermanentlyLost(id.to_string())))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectionMonitor {
        ConnectionMonitor::new(Thresholds {
            suspect_after: Duration::from_secs(60),
            lost_after: Duration::from_secs(90),
            evict_after: Duration::from_secs(150),
        })
    }

    #[test]
    fn silent_endpoint_walks_every_state_in_order() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.register("phone-a", t0);

        assert!(m.sweep(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(m.state("phone-a"), Some(Liveness::Connected));

        let ev = m.sweep(t0 + Duration::from_secs(60));
        assert_eq!(ev, vec![MonitorEvent::Suspect("phone-a".into())]);
        assert_eq!(m.state("phone-a"), Some(Liveness::Suspect));

        let ev = m.sweep(t0 + Duration::from_secs(95));
        assert_eq!(ev, vec![MonitorEvent::Lost("phone-a".into())]);
        assert_eq!(m.state("phone-a"), Some(Liveness::Lost));

        // Still present right up to the final transition.
        assert!(m.sweep(t0 + Duration::from_secs(149)).is_empty());
        assert_eq!(m.state("phone-a"), Some(Liveness::Lost));

        let ev = m.sweep(t0 + Duration::from_secs(150));
        assert_eq!(ev, vec![MonitorEvent::PermanentlyLost("phone-a".into())]);
        assert_eq!(m.state("phone-a"), None);
        assert!(m.is_empty());
    }

    #[test]
    fn long_gap_emits_intermediate_events() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.register("phone-a", t0);

        let ev = m.sweep(t0 + Duration::from_secs(600));
        assert_eq!(
            ev,
            vec![
                MonitorEvent::Suspect("phone-a".into()),
                MonitorEvent::Lost("phone-a".into()),
                MonitorEvent::PermanentlyLost("phone-a".into()),
            ]
        );
    }

    #[test]
    fn activity_recovers_suspect_and_lost() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.register("a", t0);
        m.register("b", t0);

        m.sweep(t0 + Duration::from_secs(61));
        assert_eq!(m.state("a"), Some(Liveness::Suspect));
        assert_eq!(
            m.record_activity("a", t0 + Duration::from_secs(62)),
            Some(MonitorEvent::Recovered("a".into()))
        );
        assert_eq!(m.state("a"), Some(Liveness::Connected));

        m.sweep(t0 + Duration::from_secs(100));
        assert_eq!(m.state("b"), Some(Liveness::Lost));
        assert_eq!(
            m.record_activity("b", t0 + Duration::from_secs(101)),
            Some(MonitorEvent::Recovered("b".into()))
        );

        // Activity on a healthy endpoint is silent.
        assert_eq!(m.record_activity("a", t0 + Duration::from_secs(102)), None);
    }

    #[test]
    fn activity_resets_the_silence_clock() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.register("a", t0);
        m.record_activity("a", t0 + Duration::from_secs(50));
        assert!(m.sweep(t0 + Duration::from_secs(100)).is_empty());
        assert_eq!(m.last_heard("a"), Some(t0 + Duration::from_secs(50)));
    }

    #[test]
    fn transitions_only_move_forward() {
        let t = monitor().thresholds();
        let long = Duration::from_secs(10_000);
        assert_eq!(
            t.next_state("a", Liveness::Connected, long),
            Some((Liveness::Suspect, MonitorEvent::Suspect("a".into())))
        );
        assert_eq!(
            t.next_state("a", Liveness::Suspect, long),
            Some((Liveness::Lost, MonitorEvent::Lost("a".into())))
        );
        assert_eq!(
            t.next_state("a", Liveness::Lost, long),
            Some((Liveness::PermanentlyLost, MonitorEvent::PermanentlyLost("a".into())))
        );
        assert!(t.next_state("a", Liveness::PermanentlyLost, long).is_none());
        assert!(t.next_state("a", Liveness::Connected, Duration::from_secs(59)).is_none());
    }

    #[test]
    fn unknown_and_unregistered_endpoints() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert_eq!(m.record_activity("ghost", t0), None);

        m.register("a", t0);
        assert!(m.unregister("a"));
        assert!(!m.unregister("a"));
        assert!(m.sweep(t0 + Duration::from_secs(1_000)).is_empty());
    }
}
