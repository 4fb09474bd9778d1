//! Session lifecycle states.

use std::fmt;

use serde::Serialize;

/// State of a supervised server session.
///
/// The happy path is strictly linear:
///
/// ```text
/// Uninstalled -> Installing -> Installed -> Launching -> AwaitingBind
///     -> Connecting -> Active -> Stopping -> Stopped
/// ```
///
/// `Failed` is absorbing and reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Uninstalled,
    Installing,
    Installed,
    Launching,
    AwaitingBind,
    Connecting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninstalled => "uninstalled",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Launching => "launching",
            Self::AwaitingBind => "awaiting-bind",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// `Stopped` and `Failed` are never left once entered.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the session is between `Uninstalled` and `Active` (exclusive).
    #[must_use]
    pub fn is_starting(self) -> bool {
        matches!(
            self,
            Self::Installing
                | Self::Installed
                | Self::Launching
                | Self::AwaitingBind
                | Self::Connecting
        )
    }

    /// Whether moving from `self` to `next` is an edge of the lifecycle graph.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            // Disposal may interrupt any non-terminal state.
            Self::Stopping => self != Self::Stopping,
            Self::Stopped => self == Self::Stopping,
            Self::Installing => self == Self::Uninstalled,
            Self::Installed => self == Self::Installing,
            Self::Launching => self == Self::Installed,
            Self::AwaitingBind => self == Self::Launching,
            Self::Connecting => self == Self::AwaitingBind,
            Self::Active => self == Self::Connecting,
            Self::Uninstalled => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_PATH: [SessionState; 9] = [
        SessionState::Uninstalled,
        SessionState::Installing,
        SessionState::Installed,
        SessionState::Launching,
        SessionState::AwaitingBind,
        SessionState::Connecting,
        SessionState::Active,
        SessionState::Stopping,
        SessionState::Stopped,
    ];

    #[test]
    fn happy_path_edges_are_allowed() {
        for pair in HAPPY_PATH.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for state in HAPPY_PATH {
            assert_eq!(
                state.can_transition_to(SessionState::Failed),
                !state.is_terminal()
            );
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for next in HAPPY_PATH {
            assert!(!SessionState::Failed.can_transition_to(next));
            assert!(!SessionState::Stopped.can_transition_to(next));
        }
        assert!(!SessionState::Failed.can_transition_to(SessionState::Failed));
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(!SessionState::Installed.can_transition_to(SessionState::Active));
        assert!(!SessionState::Launching.can_transition_to(SessionState::Connecting));
        assert!(!SessionState::Active.can_transition_to(SessionState::Stopped));
        assert!(!SessionState::Active.can_transition_to(SessionState::Uninstalled));
    }

    #[test]
    fn starting_window() {
        assert!(!SessionState::Uninstalled.is_starting());
        assert!(SessionState::AwaitingBind.is_starting());
        assert!(!SessionState::Active.is_starting());
    }

    #[test]
    fn labels_are_kebab_case() {
        assert_eq!(SessionState::AwaitingBind.to_string(), "awaiting-bind");
        assert_eq!(
            serde_json::to_string(&SessionState::AwaitingBind).unwrap(),
            "\"awaiting-bind\""
        );
    }
}
