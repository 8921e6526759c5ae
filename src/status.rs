//! Lifecycle of the optional animation job attached to a chat message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationStatus {
    /// Generation was not requested
    Disabled,
    /// Generation decided the message needs no animation
    Skipped,
    Pending,
    Processing,
    Completed,
    Error,
    Failed,
}

impl AnimationStatus {
    pub const ALL: [AnimationStatus; 7] = [
        AnimationStatus::Disabled,
        AnimationStatus::Skipped,
        AnimationStatus::Pending,
        AnimationStatus::Processing,
        AnimationStatus::Completed,
        AnimationStatus::Error,
        AnimationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnimationStatus::Disabled => "disabled",
            AnimationStatus::Skipped => "skipped",
            AnimationStatus::Pending => "pending",
            AnimationStatus::Processing => "processing",
            AnimationStatus::Completed => "completed",
            AnimationStatus::Error => "error",
            AnimationStatus::Failed => "failed",
        }
    }

    /// A polling client stops once this returns true.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnimationStatus::Pending | AnimationStatus::Processing)
    }

    pub fn can_transition_to(&self, next: AnimationStatus) -> bool {
        use AnimationStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Disabled, Pending)
                | (Skipped, Pending)
                | (Error, Pending)
                | (Failed, Pending)
        )
    }

    /// States a duplicate query may put back into the queue.
    pub fn can_requeue(&self) -> bool {
        self.can_transition_to(AnimationStatus::Pending)
    }
}

impl fmt::Display for AnimationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnimationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnimationStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown animation status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AnimationStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Skipped));
    }

    #[test]
    fn completed_is_final() {
        for next in AnimationStatus::ALL {
            assert!(!Completed.can_transition_to(next), "completed -> {}", next);
        }
    }

    #[test]
    fn forbidden_transitions() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Disabled.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn requeue_from_idle_states_only() {
        assert!(Disabled.can_requeue());
        assert!(Skipped.can_requeue());
        assert!(Error.can_requeue());
        assert!(Failed.can_requeue());
        assert!(!Pending.can_requeue());
        assert!(!Processing.can_requeue());
        assert!(!Completed.can_requeue());
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = AnimationStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![Disabled, Skipped, Completed, Error, Failed]);
    }

    #[test]
    fn parses_and_serializes_lowercase() {
        for status in AnimationStatus::ALL {
            assert_eq!(status.as_str().parse::<AnimationStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_string(&Processing).unwrap(), "\"processing\"");
        assert!("Completed".parse::<AnimationStatus>().is_err());
    }
}
