//! Anti-collision name negotiation
//!
//! After every fresh connection a device listens on its retained availability and
//! status topics before emitting anything of its own. What it hears decides whether
//! another live device already holds the configured name. The decision table is the
//! pure function [`resolve`]; [`Negotiation`] only tracks the state and deadline.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Fresh connection, nothing heard yet
    Begin,
    /// Someone announced availability under our name; waiting for the status holder
    ReceivedAvailable,
    /// A status payload from another device was seen
    ReceivedOtherDevice,
    /// The name is ours
    Done,
}

/// Inputs to the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Status payload on our status topic; `own` when its hardware id is ours
    Status { own: bool },
    /// Availability payload on our availability topic
    Availability(bool),
    /// The negotiation deadline passed with no decisive event
    DeadlineElapsed,
}

/// Outcome of one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing changes
    Ignore,
    /// Move to an intermediate state
    Advance(NegotiationState),
    /// Claim the name
    Succeed,
    /// Another device holds the name: drop the connection and back off
    Fail,
    /// Already holding the name; re-assert it with an immediate heartbeat
    Refresh,
}

/// Decide what an event means in the given state.
///
/// `status_topic_configured` matters for one case: availability seen in `Begin`
/// with no status topic cannot be attributed to us, so it fails outright.
pub fn resolve(
    state: NegotiationState,
    event: NegotiationEvent,
    status_topic_configured: bool,
) -> Resolution {
    use NegotiationEvent::{Availability, DeadlineElapsed, Status};
    use NegotiationState::{Begin, Done, ReceivedAvailable, ReceivedOtherDevice};

    match (event, state) {
        (Status { own: false }, ReceivedAvailable) => Resolution::Fail,
        (Status { own: false }, Done) => Resolution::Refresh,
        (Status { own: false }, Begin) => Resolution::Advance(ReceivedOtherDevice),
        (Status { own: false }, ReceivedOtherDevice) => Resolution::Ignore,
        (Status { own: true }, Done) => Resolution::Ignore,
        (Status { own: true }, Begin | ReceivedAvailable | ReceivedOtherDevice) => {
            Resolution::Succeed
        }

        (Availability(true), Begin) if status_topic_configured => {
            Resolution::Advance(ReceivedAvailable)
        }
        (Availability(true), Begin) => Resolution::Fail,
        (Availability(true), ReceivedOtherDevice) => Resolution::Fail,
        (Availability(true), ReceivedAvailable | Done) => Resolution::Ignore,
        (Availability(false), Done) => Resolution::Refresh,
        (Availability(false), Begin | ReceivedAvailable | ReceivedOtherDevice) => {
            Resolution::Succeed
        }

        (DeadlineElapsed, Done) => Resolution::Ignore,
        (DeadlineElapsed, Begin | ReceivedAvailable | ReceivedOtherDevice) => {
            Resolution::Succeed
        }
    }
}

/// Negotiation state plus the optimistic deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    state: NegotiationState,
    deadline_ms: Option<u64>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Begin,
            deadline_ms: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn is_done(&self) -> bool {
        self.state == NegotiationState::Done
    }

    /// Start listening on a fresh connection
    pub fn begin(&mut self, now_ms: u64, timeout_ms: u64) {
        self.state = NegotiationState::Begin;
        self.deadline_ms = Some(now_ms.saturating_add(timeout_ms));
        debug!(deadline_ms = ?self.deadline_ms, "Negotiation started");
    }

    pub fn advance(&mut self, next: NegotiationState) {
        debug!(from = ?self.state, to = ?next, "Negotiation advanced");
        self.state = next;
    }

    /// Name claimed; the deadline no longer applies
    pub fn complete(&mut self) {
        self.state = NegotiationState::Done;
        self.deadline_ms = None;
    }

    /// Back to square one for the next connection
    pub fn reset(&mut self) {
        self.state = NegotiationState::Begin;
        self.deadline_ms = None;
    }

    pub fn deadline_elapsed(&self, now_ms: u64) -> bool {
        !self.is_done() && self.deadline_ms.is_some_and(|deadline| now_ms >= deadline)
    }
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationEvent::*;
    use super::NegotiationState::*;
    use super::*;

    const ALL_STATES: [NegotiationState; 4] = [Begin, ReceivedAvailable, ReceivedOtherDevice, Done];

    #[test]
    fn test_foreign_status() {
        let foreign = Status { own: false };
        assert_eq!(resolve(ReceivedAvailable, foreign, true), Resolution::Fail);
        assert_eq!(resolve(Done, foreign, true), Resolution::Refresh);
        assert_eq!(
            resolve(Begin, foreign, true),
            Resolution::Advance(ReceivedOtherDevice)
        );
        assert_eq!(resolve(ReceivedOtherDevice, foreign, true), Resolution::Ignore);
    }

    #[test]
    fn test_own_status_succeeds_unless_done() {
        for state in [Begin, ReceivedAvailable, ReceivedOtherDevice] {
            assert_eq!(resolve(state, Status { own: true }, true), Resolution::Succeed);
        }
        assert_eq!(resolve(Done, Status { own: true }, true), Resolution::Ignore);
    }

    #[test]
    fn test_availability_true() {
        assert_eq!(
            resolve(Begin, Availability(true), true),
            Resolution::Advance(ReceivedAvailable)
        );
        assert_eq!(resolve(Begin, Availability(true), false), Resolution::Fail);
        assert_eq!(
            resolve(ReceivedOtherDevice, Availability(true), true),
            Resolution::Fail
        );
        assert_eq!(
            resolve(ReceivedAvailable, Availability(true), true),
            Resolution::Ignore
        );
        assert_eq!(resolve(Done, Availability(true), true), Resolution::Ignore);
    }

    #[test]
    fn test_availability_false() {
        assert_eq!(resolve(Done, Availability(false), true), Resolution::Refresh);
        for state in [Begin, ReceivedAvailable, ReceivedOtherDevice] {
            assert_eq!(resolve(state, Availability(false), true), Resolution::Succeed);
            assert_eq!(resolve(state, Availability(false), false), Resolution::Succeed);
        }
    }

    #[test]
    fn test_deadline_is_optimistic() {
        for state in ALL_STATES {
            let expected = if state == Done {
                Resolution::Ignore
            } else {
                Resolution::Succeed
            };
            assert_eq!(resolve(state, DeadlineElapsed, true), expected);
        }
    }

    #[test]
    fn test_collision_fails_in_either_arrival_order() {
        // availability first, then the other device's status
        let Resolution::Advance(mid) = resolve(Begin, Availability(true), true) else {
            panic!("availability should advance from Begin");
        };
        assert_eq!(resolve(mid, Status { own: false }, true), Resolution::Fail);

        // status first, then availability
        let Resolution::Advance(mid) = resolve(Begin, Status { own: false }, true) else {
            panic!("foreign status should advance from Begin");
        };
        assert_eq!(resolve(mid, Availability(true), true), Resolution::Fail);
    }

    #[test]
    fn test_negotiation_deadline_lifecycle() {
        let mut negotiation = Negotiation::new();
        assert!(!negotiation.deadline_elapsed(u64::MAX));

        negotiation.begin(100, 2_000);
        assert_eq!(negotiation.deadline_ms(), Some(2_100));
        assert!(!negotiation.deadline_elapsed(2_099));
        assert!(negotiation.deadline_elapsed(2_100));

        negotiation.advance(ReceivedAvailable);
        assert!(negotiation.deadline_elapsed(2_100));

        negotiation.complete();
        assert_eq!(negotiation.state(), Done);
        assert_eq!(negotiation.deadline_ms(), None);
        assert!(!negotiation.deadline_elapsed(u64::MAX));

        negotiation.reset();
        assert_eq!(negotiation.state(), Begin);
        assert_eq!(negotiation.deadline_ms(), None);
    }
}
