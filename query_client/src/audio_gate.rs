//! Gate sub-machine controlling when caller-supplied audio may be written.

use log::debug;

use crate::types::AudioGateState;

/// Edges walked by gate transitions; the lifecycle maps them to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateEdge {
    ActivationStarted,
    Activated,
    DeactivationStarted,
    Deactivated,
}

/// Nested state machine for audio-bearing requests. Text-only requests
/// keep the gate `Off` for their entire life.
#[derive(Debug, Default)]
pub(crate) struct AudioGate {
    state: AudioGateState,
}

impl AudioGate {
    pub fn state(&self) -> AudioGateState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AudioGateState::Activating | AudioGateState::On)
    }

    /// Writes are only accepted while the gate is fully on.
    pub fn accepts_writes(&self) -> bool {
        self.state == AudioGateState::On
    }

    /// `Off → Activating`. No-op when already active.
    pub fn begin_activation(&mut self) -> Option<GateEdge> {
        match self.state {
            AudioGateState::Off => {
                self.state = AudioGateState::Activating;
                Some(GateEdge::ActivationStarted)
            }
            other => {
                debug!("audio activation requested while gate is {:?}; ignoring", other);
                None
            }
        }
    }

    /// `Activating → On`, once the request's readiness check is satisfied.
    pub fn confirm_activation(&mut self) -> Option<GateEdge> {
        match self.state {
            AudioGateState::Activating => {
                self.state = AudioGateState::On;
                Some(GateEdge::Activated)
            }
            other => {
                debug!("audio activation confirmed while gate is {:?}; ignoring", other);
                None
            }
        }
    }

    /// `On|Activating → Deactivating → Off`, returning the edges walked.
    /// Both edges run in one step; the gate never rests in `Deactivating`.
    pub fn deactivate(&mut self) -> Vec<GateEdge> {
        match self.state {
            AudioGateState::On | AudioGateState::Activating => {
                self.state = AudioGateState::Off;
                vec![GateEdge::DeactivationStarted, GateEdge::Deactivated]
            }
            AudioGateState::Deactivating | AudioGateState::Off => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_edges() {
        let mut gate = AudioGate::default();
        assert_eq!(gate.state(), AudioGateState::Off);
        assert!(!gate.accepts_writes());

        assert_eq!(gate.begin_activation(), Some(GateEdge::ActivationStarted));
        assert_eq!(gate.state(), AudioGateState::Activating);
        assert!(gate.is_active());
        assert!(!gate.accepts_writes());

        assert_eq!(gate.confirm_activation(), Some(GateEdge::Activated));
        assert_eq!(gate.state(), AudioGateState::On);
        assert!(gate.accepts_writes());
    }

    #[test]
    fn test_begin_activation_is_noop_when_active() {
        let mut gate = AudioGate::default();
        gate.begin_activation();
        assert_eq!(gate.begin_activation(), None);
        gate.confirm_activation();
        assert_eq!(gate.begin_activation(), None);
    }

    #[test]
    fn test_confirm_requires_activating() {
        let mut gate = AudioGate::default();
        assert_eq!(gate.confirm_activation(), None);
        assert_eq!(gate.state(), AudioGateState::Off);
    }

    #[test]
    fn test_deactivation_edges() {
        let mut gate = AudioGate::default();
        gate.begin_activation();
        gate.confirm_activation();

        assert_eq!(
            gate.deactivate(),
            vec![GateEdge::DeactivationStarted, GateEdge::Deactivated]
        );
        assert_eq!(gate.state(), AudioGateState::Off);
        assert!(!gate.accepts_writes());

        // Second deactivation walks nothing
        assert!(gate.deactivate().is_empty());
    }

    #[test]
    fn test_deactivation_while_activating() {
        let mut gate = AudioGate::default();
        gate.begin_activation();
        assert_eq!(
            gate.deactivate(),
            vec![GateEdge::DeactivationStarted, GateEdge::Deactivated]
        );
        assert_eq!(gate.state(), AudioGateState::Off);
    }
}
