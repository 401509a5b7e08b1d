// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The runner command could not be spawned.
    LaunchFailed,
    /// Not ready before the readiness deadline.
    ReadinessTimeout,
    /// Exited with a non-zero code.
    ExitCode(i32),
    /// Killed by a signal we did not send.
    Signaled(i32),
    /// Ignored SIGTERM and was SIGKILLed during shutdown.
    ForceKilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Spawned, readiness not yet observed.
    Starting,
    /// Ready.
    Running,
    /// Exited cleanly, or stopped by us.
    Exited(i32),
    Failed(FailureReason),
}

impl ChildStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, ChildStatus::Starting | ChildStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_alive()
    }

    /// No restarts: once terminal, a child stays terminal.
    pub(crate) fn can_transition_to(self, next: ChildStatus) -> bool {
        use ChildStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Exited(_))
                | (Starting, Failed(_))
                | (Running, Exited(_))
                | (Running, Failed(_))
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LaunchFailed => write!(f, "launch failed"),
            FailureReason::ReadinessTimeout => write!(f, "readiness timeout"),
            FailureReason::ExitCode(code) => match crate::runner::RunnerExit::from_code(*code) {
                Some(exit) => write!(f, "exit code {code} ({exit})"),
                None => write!(f, "exit code {code}"),
            },
            FailureReason::Signaled(sig) => write!(f, "killed by signal {sig}"),
            FailureReason::ForceKilled => write!(f, "force killed"),
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Starting => write!(f, "starting"),
            ChildStatus::Running => write!(f, "running"),
            ChildStatus::Exited(code) => write!(f, "exited({code})"),
            ChildStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ChildStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed(FailureReason::ReadinessTimeout)));
        assert!(Running.can_transition_to(Exited(0)));
        assert!(Running.can_transition_to(Failed(FailureReason::Signaled(9))));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Exited(0).can_transition_to(Running));
        assert!(!Failed(FailureReason::ForceKilled).can_transition_to(Running));
        assert!(!Failed(FailureReason::LaunchFailed).can_transition_to(Exited(0)));
    }

    #[test]
    fn test_alive() {
        assert!(ChildStatus::Starting.is_alive());
        assert!(ChildStatus::Running.is_alive());
        assert!(ChildStatus::Exited(0).is_terminal());
        assert!(ChildStatus::Failed(FailureReason::ForceKilled).is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ChildStatus::Exited(143).to_string(), "exited(143)");
        assert_eq!(
            ChildStatus::Failed(FailureReason::ExitCode(3)).to_string(),
            "failed: exit code 3 (endpoint conflict)"
        );
        assert_eq!(
            ChildStatus::Failed(FailureReason::ExitCode(77)).to_string(),
            "failed: exit code 77"
        );
    }
}
