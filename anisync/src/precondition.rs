use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::descriptor::JobDescriptor;
use crate::penalty::{PenaltyTracker, SubProtocol};

/// A named check that must pass before a job type may be dispatched.
///
/// Implementations must be cheap and side-effect free; the scheduler
/// evaluates them for every registered kind on each claim.
pub trait Precondition: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// `None` when the check passes, otherwise how long to wait.
    fn check(&self, now: DateTime<Utc>) -> Option<Duration>;
}

/// Blocks while a sub-protocol is banned or backing off.
pub struct SubProtocolAvailable {
    tracker: Arc<PenaltyTracker>,
    sub_protocol: SubProtocol,
    name: String,
}

impl SubProtocolAvailable {
    pub fn new(tracker: Arc<PenaltyTracker>, sub_protocol: SubProtocol) -> Self {
        Self {
            tracker,
            sub_protocol,
            name: format!("{sub_protocol}-available"),
        }
    }

    pub fn sub_protocol(&self) -> SubProtocol {
        self.sub_protocol
    }
}

impl fmt::Debug for SubProtocolAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubProtocolAvailable")
            .field("sub_protocol", &self.sub_protocol)
            .finish_non_exhaustive()
    }
}

impl Precondition for SubProtocolAvailable {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, now: DateTime<Utc>) -> Option<Duration> {
        let wait = self.tracker.retry_after_at(self.sub_protocol, now);
        (!wait.is_zero()).then_some(wait)
    }
}

/// Result of evaluating every precondition of a job type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateDecision {
    pub can_run: bool,
    /// Longest wait among failing preconditions.
    pub retry_in: Duration,
    pub blocked_by: Vec<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            can_run: true,
            retry_in: Duration::ZERO,
            blocked_by: Vec::new(),
        }
    }
}

/// Evaluates the preconditions a job descriptor declares.
#[derive(Clone, Debug)]
pub struct PreconditionGate {
    clock: Arc<dyn Clock>,
}

impl PreconditionGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn evaluate(&self, descriptor: &JobDescriptor) -> GateDecision {
        self.evaluate_at(descriptor, self.clock.now())
    }

    pub fn evaluate_at(&self, descriptor: &JobDescriptor, now: DateTime<Utc>) -> GateDecision {
        let mut decision = GateDecision::allow();
        for precondition in descriptor.preconditions() {
            if let Some(wait) = precondition.check(now) {
                decision.can_run = false;
                decision.retry_in = decision.retry_in.max(wait);
                decision.blocked_by.push(precondition.name().to_string());
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::penalty::PenaltyConfig;

    #[derive(Debug)]
    struct FixedWait(&'static str, Option<Duration>);

    impl Precondition for FixedWait {
        fn name(&self) -> &str {
            self.0
        }

        fn check(&self, _now: DateTime<Utc>) -> Option<Duration> {
            self.1
        }
    }

    fn setup() -> (Arc<PenaltyTracker>, PreconditionGate, ManualClock) {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let tracker = Arc::new(PenaltyTracker::new(PenaltyConfig::default(), shared.clone()));
        (tracker, PreconditionGate::new(shared), clock)
    }

    #[test]
    fn descriptor_without_preconditions_runs() {
        let (_tracker, gate, _clock) = setup();
        let descriptor = JobDescriptor::new("local.hash");
        assert_eq!(gate.evaluate(&descriptor), GateDecision::allow());
    }

    #[test]
    fn ban_blocks_until_cleared() {
        let (tracker, gate, _clock) = setup();
        let descriptor = JobDescriptor::new("anidb.get_file")
            .requires(SubProtocolAvailable::new(tracker.clone(), SubProtocol::Udp));

        tracker.mark_banned(SubProtocol::Udp, None);
        let blocked = gate.evaluate(&descriptor);
        assert!(!blocked.can_run);
        assert_eq!(blocked.retry_in, Duration::from_secs(1800));
        assert_eq!(blocked.blocked_by, vec!["udp-available".to_string()]);

        tracker.mark_clear(SubProtocol::Udp);
        assert!(gate.evaluate(&descriptor).can_run);
    }

    #[test]
    fn http_ban_does_not_block_udp_kinds() {
        let (tracker, gate, _clock) = setup();
        let descriptor = JobDescriptor::new("anidb.get_file")
            .requires(SubProtocolAvailable::new(tracker.clone(), SubProtocol::Udp));

        tracker.mark_banned(SubProtocol::Http, None);
        assert!(gate.evaluate(&descriptor).can_run);
    }

    #[test]
    fn longest_wait_wins() {
        let (_tracker, gate, _clock) = setup();
        let descriptor = JobDescriptor::new("mixed")
            .requires(FixedWait("short", Some(Duration::from_secs(5))))
            .requires(FixedWait("passes", None))
            .requires(FixedWait("long", Some(Duration::from_secs(50))));

        let decision = gate.evaluate(&descriptor);
        assert!(!decision.can_run);
        assert_eq!(decision.retry_in, Duration::from_secs(50));
        assert_eq!(decision.blocked_by, vec!["short".to_string(), "long".to_string()]);
    }

    #[test]
    fn passes_once_estimate_elapses() {
        let (tracker, gate, clock) = setup();
        let descriptor = JobDescriptor::new("anidb.get_file")
            .requires(SubProtocolAvailable::new(tracker.clone(), SubProtocol::Udp));

        tracker.mark_banned(
            SubProtocol::Udp,
            Some(clock.now() + chrono::Duration::minutes(5)),
        );
        assert!(!gate.evaluate(&descriptor).can_run);

        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert!(gate.evaluate(&descriptor).can_run);
    }
}
