//! Session state and the pure transition rules.
//!
//! [`Machine`] holds the attempt counter and the "accepting" flag and is only
//! ever touched by the session task, so every transition is serialized.

use stillcap_core::ExhaustionPolicy;
use thiserror::Error;

use crate::classifier::Verdict;

// MARK: - SessionState

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingGrant,
    Settling,
    Capturing,
    Validating,
    Accepted,
    Retrying,
    Exhausted,
    Aborted,
    Released,
}

impl SessionState {
    /// A terminal outcome has been decided.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Exhausted | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Idle, AwaitingGrant)
            | (AwaitingGrant, Settling)
            | (Settling, Capturing)
            | (Capturing, Validating)
            | (Validating, Accepted | Retrying | Exhausted)
            | (Retrying, Capturing)
            | (Accepted | Exhausted | Aborted, Released) => true,
            (from, Aborted) => !from.is_terminal() && from != Released,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal session transition {from:?} → {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

// MARK: - Machine

/// What to do with a classified frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Encode this frame. `best_effort` when it was accepted only because
    /// the attempts ran out.
    Accept { best_effort: bool },
    /// Wait, then classify the next delivery. Carries the new attempt index.
    Retry { attempt: u32 },
    /// Attempts ran out under [`ExhaustionPolicy::Fail`].
    Exhaust,
}

#[derive(Debug)]
pub struct Machine {
    state: SessionState,
    /// 0-based index of the attempt being classified.
    attempt: u32,
    accepting: bool,
    max_attempts: u32,
    policy: ExhaustionPolicy,
}

impl Machine {
    pub fn new(max_attempts: u32, policy: ExhaustionPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            attempt: 0,
            accepting: false,
            max_attempts: max_attempts.max(1),
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    /// Gate for a delivered frame. Returns `true` if this frame is the one to
    /// classify; every other delivery is dropped.
    pub fn begin_validation(&mut self) -> bool {
        if self.state != SessionState::Capturing || self.accepting {
            return false;
        }
        self.accepting = true;
        self.state = SessionState::Validating;
        true
    }

    /// Decide on the frame admitted by [`begin_validation`](Self::begin_validation).
    pub fn on_verdict(&mut self, verdict: Verdict) -> Result<Step, IllegalTransition> {
        let last_attempt = self.attempt + 1 >= self.max_attempts;
        match (verdict, last_attempt, self.policy) {
            (Verdict::Valid, _, _) => {
                self.transition(SessionState::Accepted)?;
                Ok(Step::Accept { best_effort: false })
            }
            (Verdict::Suspect, false, _) => {
                self.transition(SessionState::Retrying)?;
                self.attempt += 1;
                Ok(Step::Retry { attempt: self.attempt })
            }
            (Verdict::Suspect, true, ExhaustionPolicy::AcceptBestEffort) => {
                self.transition(SessionState::Accepted)?;
                Ok(Step::Accept { best_effort: true })
            }
            (Verdict::Suspect, true, ExhaustionPolicy::Fail) => {
                self.transition(SessionState::Exhausted)?;
                Ok(Step::Exhaust)
            }
        }
    }

    /// The inter-attempt wait elapsed: admit the next delivery.
    pub fn resume_capturing(&mut self) -> Result<(), IllegalTransition> {
        self.transition(SessionState::Capturing)?;
        self.accepting = false;
        Ok(())
    }

    /// Force `Aborted`. Returns `false` if an outcome was already decided.
    pub fn abort(&mut self) -> bool {
        self.transition(SessionState::Aborted).is_ok()
    }

    /// Final step; legal only from a terminal state, forced otherwise.
    pub fn release(&mut self) -> Result<(), IllegalTransition> {
        let result = self.transition(SessionState::Released);
        self.state = SessionState::Released;
        self.accepting = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capturing(max_attempts: u32, policy: ExhaustionPolicy) -> Machine {
        let mut m = Machine::new(max_attempts, policy);
        m.transition(SessionState::AwaitingGrant).unwrap();
        m.transition(SessionState::Settling).unwrap();
        m.transition(SessionState::Capturing).unwrap();
        m
    }

    #[test]
    fn only_first_delivery_is_admitted() {
        let mut m = capturing(3, ExhaustionPolicy::AcceptBestEffort);
        assert!(m.begin_validation());
        assert!(!m.begin_validation());
        assert_eq!(m.state(), SessionState::Validating);
    }

    #[test]
    fn deliveries_outside_capturing_are_dropped() {
        let mut m = Machine::new(3, ExhaustionPolicy::AcceptBestEffort);
        assert!(!m.begin_validation());
        m.transition(SessionState::AwaitingGrant).unwrap();
        m.transition(SessionState::Settling).unwrap();
        assert!(!m.begin_validation());
    }

    #[test]
    fn suspect_frames_exhaust_into_best_effort_accept() {
        let mut m = capturing(3, ExhaustionPolicy::AcceptBestEffort);
        for expected in 1..=2 {
            assert!(m.begin_validation());
            assert_eq!(m.on_verdict(Verdict::Suspect), Ok(Step::Retry { attempt: expected }));
            assert!(!m.begin_validation(), "retrying must not admit frames");
            m.resume_capturing().unwrap();
            assert!(!m.is_accepting());
        }
        assert!(m.begin_validation());
        assert_eq!(m.on_verdict(Verdict::Suspect), Ok(Step::Accept { best_effort: true }));
        assert_eq!(m.state(), SessionState::Accepted);
    }

    #[test]
    fn fail_policy_exhausts() {
        let mut m = capturing(1, ExhaustionPolicy::Fail);
        assert!(m.begin_validation());
        assert_eq!(m.on_verdict(Verdict::Suspect), Ok(Step::Exhaust));
        assert_eq!(m.state(), SessionState::Exhausted);
    }

    #[test]
    fn valid_frame_accepts_immediately() {
        let mut m = capturing(3, ExhaustionPolicy::Fail);
        assert!(m.begin_validation());
        assert_eq!(m.on_verdict(Verdict::Valid), Ok(Step::Accept { best_effort: false }));
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn abort_is_refused_after_an_outcome() {
        let mut m = capturing(3, ExhaustionPolicy::AcceptBestEffort);
        assert!(m.begin_validation());
        m.on_verdict(Verdict::Valid).unwrap();
        assert!(!m.abort());
        assert!(m.release().is_ok());
        assert_eq!(m.state(), SessionState::Released);
    }

    #[test]
    fn abort_is_legal_from_every_live_state() {
        use SessionState::*;
        for state in [Idle, AwaitingGrant, Settling, Capturing, Validating, Retrying] {
            assert!(state.can_transition_to(Aborted), "{state:?}");
        }
        for state in [Accepted, Exhausted, Aborted, Released] {
            assert!(!state.can_transition_to(Aborted), "{state:?}");
        }
        assert!(!Settling.can_transition_to(Validating));
        assert!(!Released.can_transition_to(Released));
    }
}
