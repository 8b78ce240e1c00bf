//! Lifecycle state machine for the supervised server process.
//!
//! Transitions are driven exclusively by the supervisor; everything else
//! only ever reads the current state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Stopped
    }
}

#[derive(Error, Debug)]
#[error("invalid lifecycle transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug, Default)]
pub struct StateMachine {
    state: LifecycleState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> LifecycleState {
        self.state
    }

    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self.state, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Crashed, Stopped)
        )
    }

    pub fn transition(&mut self, to: LifecycleState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: self.state, to });
        }
        tracing::info!("Lifecycle: {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 5] = [Stopped, Starting, Running, Stopping, Crashed];

    #[test]
    fn happy_path_cycle() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.current(), Stopped);
        for to in [Starting, Running, Stopping, Stopped] {
            sm.transition(to).unwrap();
            assert_eq!(sm.current(), to);
        }
    }

    #[test]
    fn crash_paths_and_acknowledge() {
        let mut sm = StateMachine::new();
        sm.transition(Starting).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Crashed).unwrap();
        // Crashed is terminal until the reset edge is taken
        assert!(!sm.can_transition(Starting));
        assert!(!sm.can_transition(Running));
        sm.transition(Stopped).unwrap();
        assert!(sm.can_transition(Starting));
    }

    #[test]
    fn exact_transition_table() {
        // Every pair outside the table above must be rejected.
        let allowed = [
            (Stopped, Starting),
            (Starting, Running),
            (Starting, Crashed),
            (Running, Stopping),
            (Running, Crashed),
            (Stopping, Stopped),
            (Stopping, Crashed),
            (Crashed, Stopped),
        ];
        for from in ALL {
            for to in ALL {
                let sm = StateMachine { state: from };
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    sm.can_transition(to),
                    expected,
                    "transition {} -> {} should be {}",
                    from,
                    to,
                    if expected { "allowed" } else { "rejected" }
                );
            }
        }
    }

    #[test]
    fn invalid_transition_reports_both_ends() {
        let mut sm = StateMachine::new();
        let err = sm.transition(Running).unwrap_err();
        assert_eq!(err.from, Stopped);
        assert_eq!(err.to, Running);
        assert_eq!(sm.current(), Stopped, "failed transition leaves state untouched");
    }

    #[test]
    fn serde_renders_lowercase() {
        assert_eq!(serde_json::to_string(&Crashed).unwrap(), "\"crashed\"");
    }
}
