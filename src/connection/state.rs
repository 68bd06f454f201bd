//! Dial state machine

use std::fmt;

/// State of one dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    /// Opening the raw transport connection
    Connecting,

    /// TLS handshake in progress
    Handshaking,

    /// Handshake completed, stream handed to the caller
    Established,

    /// Attempt failed; nothing is handed out
    Failed,
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid dial state transition from {from} to {to}")]
pub struct DialStateError {
    /// State before the transition
    pub from: DialState,
    /// Requested state
    pub to: DialState,
}

impl DialState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: DialState) -> bool {
        use DialState::*;

        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Established)
                | (Connecting, Failed)
                | (Handshaking, Failed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: DialState) -> Result<(), DialStateError> {
        if !self.can_transition_to(next) {
            return Err(DialStateError {
                from: *self,
                to: next,
            });
        }
        tracing::trace!(from = %self, to = %next, "dial state changed");
        *self = next;
        Ok(())
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

impl fmt::Display for DialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Established => write!(f, "established"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut state = DialState::Connecting;
        assert!(state.transition(DialState::Handshaking).is_ok());
        assert!(state.transition(DialState::Established).is_ok());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_cannot_skip_handshake() {
        let mut state = DialState::Connecting;
        let err = state.transition(DialState::Established).unwrap_err();
        assert_eq!(err.from, DialState::Connecting);
        assert_eq!(state, DialState::Connecting);
    }

    #[test]
    fn test_fail_from_connecting_or_handshaking() {
        let mut state = DialState::Connecting;
        assert!(state.transition(DialState::Failed).is_ok());

        let mut state = DialState::Handshaking;
        assert!(state.transition(DialState::Failed).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut state = DialState::Established;
        assert!(state.transition(DialState::Failed).is_err());

        let mut state = DialState::Failed;
        assert!(state.transition(DialState::Connecting).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(DialState::Handshaking.to_string(), "handshaking");
        assert_eq!(
            DialStateError {
                from: DialState::Failed,
                to: DialState::Connecting
            }
            .to_string(),
            "invalid dial state transition from failed to connecting"
        );
    }
}
