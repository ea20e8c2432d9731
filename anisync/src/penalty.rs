use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::{remaining, to_time_delta, Clock};
use crate::config::PenaltySettings;

/// Upstream channel a penalty applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProtocol {
    Udp,
    Http,
}

impl SubProtocol {
    pub const ALL: [SubProtocol; 2] = [SubProtocol::Udp, SubProtocol::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubProtocol::Udp => "udp",
            SubProtocol::Http => "http",
        }
    }

    fn slot(&self) -> usize {
        match self {
            SubProtocol::Udp => 0,
            SubProtocol::Http => 1,
        }
    }
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ban and backoff state of one sub-protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanState {
    pub banned: bool,
    pub banned_at: Option<DateTime<Utc>>,
    /// Estimated end of the ban. Always set while `banned`.
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    /// End of a "server busy" backoff.
    pub backoff_until: Option<DateTime<Utc>>,
    pub backoff_reason: Option<String>,
}

impl BanState {
    /// The latest instant at which the sub-protocol stops being blocked.
    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        let ban = if self.banned { self.expires_at } else { None };
        match (ban, self.backoff_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Change notifications emitted by [`PenaltyTracker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PenaltyEvent {
    Banned {
        sub_protocol: SubProtocol,
        expires_at: DateTime<Utc>,
        reason: Option<String>,
    },
    BackedOff {
        sub_protocol: SubProtocol,
        until: DateTime<Utc>,
    },
    Cleared {
        sub_protocol: SubProtocol,
    },
}

/// Ban windows used when the provider does not say how long a penalty lasts.
#[derive(Clone, Debug)]
pub struct PenaltyConfig {
    pub udp_ban_window: Duration,
    pub http_ban_window: Duration,
    pub busy_backoff: Duration,
}

impl PenaltyConfig {
    pub fn ban_window(&self, sub_protocol: SubProtocol) -> Duration {
        match sub_protocol {
            SubProtocol::Udp => self.udp_ban_window,
            SubProtocol::Http => self.http_ban_window,
        }
    }
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self::from(&PenaltySettings::default())
    }
}

impl From<&PenaltySettings> for PenaltyConfig {
    fn from(settings: &PenaltySettings) -> Self {
        Self {
            udp_ban_window: Duration::from_secs(settings.udp_ban_window_secs),
            http_ban_window: Duration::from_secs(settings.http_ban_window_secs),
            busy_backoff: Duration::from_secs(settings.busy_backoff_secs),
        }
    }
}

/// Shared ban state for every sub-protocol.
///
/// Both sub-protocol states live behind one lock, so a reader always sees a
/// consistent flag and expiry pair. The tracker is an ordinary value: build
/// one per process (or per test) and hand out `Arc`s.
pub struct PenaltyTracker {
    config: PenaltyConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<[BanState; 2]>,
    events: broadcast::Sender<PenaltyEvent>,
}

impl fmt::Debug for PenaltyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PenaltyTracker");
        debug.field("config", &self.config);
        match self.states.try_lock() {
            Some(states) => {
                debug.field("udp", &states[0]);
                debug.field("http", &states[1]);
            }
            None => {
                debug.field("states", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl PenaltyTracker {
    pub fn new(config: PenaltyConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            clock,
            states: Mutex::new([BanState::default(), BanState::default()]),
            events,
        }
    }

    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PenaltyEvent> {
        self.events.subscribe()
    }

    /// Records a ban. Without an estimate the configured window applies.
    pub fn mark_banned(
        &self,
        sub_protocol: SubProtocol,
        estimated_expiry: Option<DateTime<Utc>>,
    ) {
        self.mark_banned_because(sub_protocol, estimated_expiry, None::<String>);
    }

    pub fn mark_banned_because(
        &self,
        sub_protocol: SubProtocol,
        estimated_expiry: Option<DateTime<Utc>>,
        reason: Option<impl Into<String>>,
    ) {
        let now = self.clock.now();
        let expires_at = estimated_expiry.unwrap_or_else(|| {
            now + to_time_delta(self.config.ban_window(sub_protocol))
        });
        let reason = reason.map(Into::into);

        {
            let mut states = self.states.lock();
            let state = &mut states[sub_protocol.slot()];
            if !state.banned {
                state.banned_at = Some(now);
            }
            state.banned = true;
            state.expires_at = Some(expires_at);
            state.reason = reason.clone();
        }

        tracing::warn!(
            sub_protocol = %sub_protocol,
            expires_at = %expires_at,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "upstream ban recorded"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_penalty(sub_protocol.as_str(), "banned");
        let _ = self.events.send(PenaltyEvent::Banned {
            sub_protocol,
            expires_at,
            reason,
        });
    }

    /// Records a "server busy" backoff. Extends, never shortens, an
    /// existing backoff.
    pub fn mark_backoff(
        &self,
        sub_protocol: SubProtocol,
        duration: Duration,
        reason: impl Into<String>,
    ) {
        let until = self.clock.now() + to_time_delta(duration);
        let reason = reason.into();

        let until = {
            let mut states = self.states.lock();
            let state = &mut states[sub_protocol.slot()];
            let until = state.backoff_until.map_or(until, |current| current.max(until));
            state.backoff_until = Some(until);
            state.backoff_reason = Some(reason.clone());
            until
        };

        tracing::info!(
            sub_protocol = %sub_protocol,
            until = %until,
            reason = %reason,
            "upstream asked for backoff"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_penalty(sub_protocol.as_str(), "backoff");
        let _ = self.events.send(PenaltyEvent::BackedOff {
            sub_protocol,
            until,
        });
    }

    /// Clears ban and backoff after a successful, non-ban reply.
    pub fn mark_clear(&self, sub_protocol: SubProtocol) {
        let was_penalised = {
            let mut states = self.states.lock();
            let state = &mut states[sub_protocol.slot()];
            let was_penalised = state.banned || state.backoff_until.is_some();
            *state = BanState::default();
            was_penalised
        };

        if was_penalised {
            tracing::info!(sub_protocol = %sub_protocol, "upstream penalty lifted");
            let _ = self.events.send(PenaltyEvent::Cleared { sub_protocol });
        }
    }

    /// Banned and still inside the estimated window.
    pub fn is_banned(&self, sub_protocol: SubProtocol) -> bool {
        let now = self.clock.now();
        let states = self.states.lock();
        let state = &states[sub_protocol.slot()];
        state.banned && state.expires_at.is_some_and(|expiry| now < expiry)
    }

    pub fn retry_after(&self, sub_protocol: SubProtocol) -> Duration {
        self.retry_after_at(sub_protocol, self.clock.now())
    }

    /// Time until neither the ban estimate nor the backoff blocks requests.
    pub fn retry_after_at(&self, sub_protocol: SubProtocol, now: DateTime<Utc>) -> Duration {
        let states = self.states.lock();
        states[sub_protocol.slot()]
            .blocked_until()
            .map_or(Duration::ZERO, |until| remaining(now, until))
    }

    pub fn state(&self, sub_protocol: SubProtocol) -> BanState {
        self.states.lock()[sub_protocol.slot()].clone()
    }

    /// Earliest future instant at which some penalty runs out.
    pub fn next_unblock_at(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let states = self.states.lock();
        states
            .iter()
            .filter_map(BanState::blocked_until)
            .filter(|until| *until > now)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (PenaltyTracker, ManualClock) {
        let clock = ManualClock::starting_now();
        let tracker = PenaltyTracker::new(PenaltyConfig::default(), Arc::new(clock.clone()));
        (tracker, clock)
    }

    #[test]
    fn default_window_applies_without_estimate() {
        let (tracker, clock) = tracker();
        tracker.mark_banned(SubProtocol::Udp, None);

        let state = tracker.state(SubProtocol::Udp);
        assert!(state.banned);
        assert_eq!(
            state.expires_at,
            Some(clock.now() + chrono::Duration::minutes(30))
        );
        assert_eq!(tracker.retry_after(SubProtocol::Udp), Duration::from_secs(1800));
        assert!(!tracker.is_banned(SubProtocol::Http));
    }

    #[test]
    fn clear_wins_over_estimate() {
        let (tracker, _clock) = tracker();
        tracker.mark_banned(SubProtocol::Http, None);
        tracker.mark_clear(SubProtocol::Http);

        assert!(!tracker.is_banned(SubProtocol::Http));
        assert_eq!(tracker.retry_after(SubProtocol::Http), Duration::ZERO);
        assert_eq!(tracker.state(SubProtocol::Http), BanState::default());
    }

    #[test]
    fn expired_estimate_stops_blocking_but_keeps_flag() {
        let (tracker, clock) = tracker();
        tracker.mark_banned(SubProtocol::Udp, Some(clock.now() + chrono::Duration::minutes(5)));

        clock.advance(Duration::from_secs(301));

        assert!(!tracker.is_banned(SubProtocol::Udp));
        assert_eq!(tracker.retry_after(SubProtocol::Udp), Duration::ZERO);
        assert!(tracker.state(SubProtocol::Udp).banned);
    }

    #[test]
    fn backoff_extends_and_counts_towards_retry_after() {
        let (tracker, clock) = tracker();
        tracker.mark_backoff(SubProtocol::Udp, Duration::from_secs(60), "busy");
        tracker.mark_backoff(SubProtocol::Udp, Duration::from_secs(10), "busy again");

        assert!(!tracker.is_banned(SubProtocol::Udp));
        assert_eq!(tracker.retry_after(SubProtocol::Udp), Duration::from_secs(60));

        clock.advance(Duration::from_secs(61));
        assert_eq!(tracker.retry_after(SubProtocol::Udp), Duration::ZERO);
        assert_eq!(tracker.next_unblock_at(), None);
    }

    #[test]
    fn clear_is_broadcast_once() {
        let (tracker, _clock) = tracker();
        let mut rx = tracker.subscribe();

        tracker.mark_banned(SubProtocol::Udp, None);
        tracker.mark_clear(SubProtocol::Udp);
        tracker.mark_clear(SubProtocol::Udp);

        assert!(matches!(rx.try_recv(), Ok(PenaltyEvent::Banned { .. })));
        assert_eq!(
            rx.try_recv().ok(),
            Some(PenaltyEvent::Cleared {
                sub_protocol: SubProtocol::Udp
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
