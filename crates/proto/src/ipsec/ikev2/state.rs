//! UE exchange state machine
//!
//! Tracks where the UE is in the sequence of IKE exchanges. The two access
//! variants share the initial and terminal states and differ in the number
//! of IKE_AUTH rounds.
//!
//! # State Transitions
//!
//! ```text
//! INIT ──> AUTH_1 ──> AUTH_2 ──> AUTH_3 ──┬──────────────────────────────> CONNECTED   (SWu)
//!                                         └─> AUTH_4 ──> AUTH_5 ──> AUTH_6 ─> CONNECTED (NWu)
//!
//! CONNECTED <──> { REKEY_IKE, REKEY_CHILD, DELETE }
//! any ──> CLOSED ──> INIT (reauthentication)
//! ```
//!
//! Every authenticating state may repeat itself once the peer asks for it
//! (synchronization failure, EAP notification, identity request).

use std::fmt;

use crate::ipsec::{Error, Result};

/// Access network variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessVariant {
    /// 5G untrusted non-3GPP access (N3IWF, EAP-5G carrying NAS)
    #[default]
    Nwu,
    /// EPC untrusted non-3GPP access (ePDG, EAP-AKA)
    Swu,
}

impl AccessVariant {
    /// Last authenticating state before CONNECTED
    pub fn final_auth_state(self) -> UeState {
        match self {
            AccessVariant::Swu => UeState::Auth3,
            AccessVariant::Nwu => UeState::Auth6,
        }
    }
}

/// UE exchange state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UeState {
    /// IKE_SA_INIT
    Init,
    /// First IKE_AUTH round (identities, CP request, child proposal)
    Auth1,
    /// EAP round
    Auth2,
    /// EAP round (SWu: final AUTH; NWu: security mode)
    Auth3,
    /// NWu: EAP success, own AUTH
    Auth4,
    /// NWu: AUTH confirmation, CP reply, child SA
    Auth5,
    /// NWu: registration and PDU session over the NAS tunnel
    Auth6,
    /// Tunnel up
    Connected,
    /// IKE SA rekey in progress
    RekeyIke,
    /// Child SA rekey in progress
    RekeyChild,
    /// INFORMATIONAL delete in progress
    Delete,
    /// Session torn down
    Closed,
}

impl UeState {
    fn auth_index(self) -> Option<u8> {
        match self {
            UeState::Auth1 => Some(1),
            UeState::Auth2 => Some(2),
            UeState::Auth3 => Some(3),
            UeState::Auth4 => Some(4),
            UeState::Auth5 => Some(5),
            UeState::Auth6 => Some(6),
            _ => None,
        }
    }

    /// Next state of the establishment flow for `variant`
    pub fn successor(self, variant: AccessVariant) -> Option<UeState> {
        if self == variant.final_auth_state() {
            return Some(UeState::Connected);
        }
        match self {
            UeState::Init => Some(UeState::Auth1),
            UeState::Auth1 => Some(UeState::Auth2),
            UeState::Auth2 => Some(UeState::Auth3),
            UeState::Auth3 => Some(UeState::Auth4),
            UeState::Auth4 => Some(UeState::Auth5),
            UeState::Auth5 => Some(UeState::Auth6),
            _ => None,
        }
    }

    /// Check if state is a valid next state
    pub fn can_transition_to(self, next: UeState, variant: AccessVariant) -> bool {
        use UeState::*;

        if let Some(index) = self.auth_index() {
            let last = variant.final_auth_state().auth_index().unwrap_or(0);
            if index > last {
                return next == Closed;
            }
        }

        match (self, next) {
            // Repeat of the same step (retry, cookie, synch failure)
            (s1, s2) if s1 == s2 && s1 != Closed => true,

            (Connected, RekeyIke | RekeyChild | Delete) => true,
            (RekeyIke | RekeyChild | Delete, Connected) => true,

            (_, Closed) => true,
            (Closed, Init) => true,

            (s, n) => s.successor(variant) == Some(n),
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, UeState::Closed)
    }

    /// Whether an IKE_AUTH round is in progress
    pub fn is_authenticating(self) -> bool {
        self.auth_index().is_some()
    }

    /// Check if the tunnel is established
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            UeState::Connected | UeState::RekeyIke | UeState::RekeyChild | UeState::Delete
        )
    }
}

impl fmt::Display for UeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UeState::Init => "INIT",
            UeState::Auth1 => "AUTH_1",
            UeState::Auth2 => "AUTH_2",
            UeState::Auth3 => "AUTH_3",
            UeState::Auth4 => "AUTH_4",
            UeState::Auth5 => "AUTH_5",
            UeState::Auth6 => "AUTH_6",
            UeState::Connected => "CONNECTED",
            UeState::RekeyIke => "REKEY_IKE",
            UeState::RekeyChild => "REKEY_CHILD",
            UeState::Delete => "DELETE",
            UeState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Exchange state machine
///
/// Manages state transitions and validates state changes.
#[derive(Debug, Clone)]
pub struct ExchangeStateMachine {
    state: UeState,
    variant: AccessVariant,
}

impl ExchangeStateMachine {
    /// Create a state machine in INIT
    pub fn new(variant: AccessVariant) -> Self {
        ExchangeStateMachine {
            state: UeState::Init,
            variant,
        }
    }

    /// Get current state
    pub fn state(&self) -> UeState {
        self.state
    }

    /// Access variant
    pub fn variant(&self) -> AccessVariant {
        self.variant
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns error if transition is invalid
    pub fn transition(&mut self, next: UeState) -> Result<()> {
        if !self.state.can_transition_to(next, self.variant) {
            return Err(Error::InvalidState(format!(
                "{} -> {} not allowed for {:?}",
                self.state, next, self.variant
            )));
        }

        crate::ipsec::logging::log_state_transition(self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to the next state of the establishment flow
    pub fn advance(&mut self) -> Result<UeState> {
        let next = self.state.successor(self.variant).ok_or_else(|| {
            Error::InvalidState(format!("No successor for {}", self.state))
        })?;
        self.transition(next)?;
        Ok(next)
    }

    /// Tear the session down
    pub fn close(&mut self) {
        if self.state != UeState::Closed {
            crate::ipsec::logging::log_state_transition(self.state, UeState::Closed);
        }
        self.state = UeState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swu_flow() {
        let mut sm = ExchangeStateMachine::new(AccessVariant::Swu);
        assert_eq!(sm.advance().unwrap(), UeState::Auth1);
        assert_eq!(sm.advance().unwrap(), UeState::Auth2);
        assert_eq!(sm.advance().unwrap(), UeState::Auth3);
        assert_eq!(sm.advance().unwrap(), UeState::Connected);
        assert!(sm.state().is_connected());
    }

    #[test]
    fn test_nwu_flow() {
        let mut sm = ExchangeStateMachine::new(AccessVariant::Nwu);
        for expected in [
            UeState::Auth1,
            UeState::Auth2,
            UeState::Auth3,
            UeState::Auth4,
            UeState::Auth5,
            UeState::Auth6,
            UeState::Connected,
        ] {
            assert_eq!(sm.advance().unwrap(), expected);
        }
    }

    #[test]
    fn test_swu_never_reaches_auth4() {
        assert!(!UeState::Auth3.can_transition_to(UeState::Auth4, AccessVariant::Swu));
        assert!(UeState::Auth3.can_transition_to(UeState::Auth4, AccessVariant::Nwu));
        assert!(!UeState::Auth5.can_transition_to(UeState::Auth5, AccessVariant::Swu));
    }

    #[test]
    fn test_repeat_and_skip() {
        use UeState::*;
        let v = AccessVariant::Nwu;
        assert!(Auth2.can_transition_to(Auth2, v));
        assert!(Init.can_transition_to(Init, v));
        assert!(!Init.can_transition_to(Auth2, v));
        assert!(!Auth1.can_transition_to(Connected, v));
        assert!(!Closed.can_transition_to(Closed, v));
    }

    #[test]
    fn test_connected_substates() {
        use UeState::*;
        let v = AccessVariant::Swu;
        for sub in [RekeyIke, RekeyChild, Delete] {
            assert!(Connected.can_transition_to(sub, v));
            assert!(sub.can_transition_to(Connected, v));
            assert!(sub.is_connected());
        }
        assert!(!RekeyIke.can_transition_to(RekeyChild, v));
        assert!(!Init.can_transition_to(RekeyIke, v));
    }

    #[test]
    fn test_close_and_restart() {
        let mut sm = ExchangeStateMachine::new(AccessVariant::Swu);
        sm.advance().unwrap();
        sm.close();
        assert!(sm.state().is_terminal());
        sm.transition(UeState::Init).unwrap();
        assert_eq!(sm.state(), UeState::Init);
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = ExchangeStateMachine::new(AccessVariant::Nwu);
        assert!(matches!(
            sm.transition(UeState::Connected),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(sm.state(), UeState::Init);
    }

    #[test]
    fn test_display() {
        assert_eq!(UeState::Auth4.to_string(), "AUTH_4");
        assert_eq!(UeState::RekeyChild.to_string(), "REKEY_CHILD");
    }
}
