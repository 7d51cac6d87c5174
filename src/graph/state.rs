//! The per-target state machine.

use std::fmt;

/// Lifecycle state of a build target.
///
/// States are totally ordered and only ever advance; every transition goes
/// through an atomic compare-and-set, so concurrent duplicate triggers
/// observe "no change" and do not re-enqueue work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TargetState {
    /// Known to the graph but not yet referenced by anything we build.
    Inactive = 0,
    /// Referenced (e.g. parsed for a query or subinclude) but not scheduled.
    Semiactive = 1,
    /// Scheduled to build once its dependencies complete.
    Active = 2,
    /// All dependencies built; sitting on the build queue.
    Pending = 3,
    /// A worker is running its command.
    Building = 4,
    /// Deliberately stopped before completion.
    Stopped = 5,
    /// Built locally in this invocation.
    Built = 6,
    /// Built by a remote executor in this invocation.
    BuiltRemotely = 7,
    /// Outputs retrieved from a cache.
    Cached = 8,
    /// Rebuilt, but outputs are identical to what was already present.
    Unchanged = 9,
    /// Outputs already present and valid; no work was needed.
    Reused = 10,
    /// Build or test failed.
    Failed = 11,
    /// Built and its tests ran successfully.
    Tested = 12,
}

impl TargetState {
    /// All states, in order.
    pub const ALL: [TargetState; 13] = [
        Self::Inactive,
        Self::Semiactive,
        Self::Active,
        Self::Pending,
        Self::Building,
        Self::Stopped,
        Self::Built,
        Self::BuiltRemotely,
        Self::Cached,
        Self::Unchanged,
        Self::Reused,
        Self::Failed,
        Self::Tested,
    ];

    /// Reconstructs a state from its atomic representation.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .unwrap_or(Self::Failed)
    }

    /// True once the target's outputs exist and dependents may proceed.
    /// Failed and Stopped targets are not built, whatever their ordering.
    #[must_use]
    pub fn is_built(self) -> bool {
        matches!(
            self,
            Self::Built
                | Self::BuiltRemotely
                | Self::Cached
                | Self::Unchanged
                | Self::Reused
                | Self::Tested
        )
    }

    /// True if the target reached a terminal state.
    #[must_use]
    pub fn is_done(self) -> bool {
        self.is_built() || matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Semiactive => "semiactive",
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Stopped => "stopped",
            Self::Built => "built",
            Self::BuiltRemotely => "built remotely",
            Self::Cached => "cached",
            Self::Unchanged => "unchanged",
            Self::Reused => "reused",
            Self::Failed => "failed",
            Self::Tested => "tested",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_lifecycle() {
        assert!(TargetState::Inactive < TargetState::Semiactive);
        assert!(TargetState::Active < TargetState::Pending);
        assert!(TargetState::Building < TargetState::Built);
        assert!(TargetState::Built < TargetState::Cached);
        assert!(TargetState::Cached < TargetState::Tested);
    }

    #[test]
    fn roundtrips_through_u8() {
        for state in TargetState::ALL {
            assert_eq!(TargetState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn built_excludes_failures() {
        assert!(TargetState::Built.is_built());
        assert!(TargetState::Cached.is_built());
        assert!(TargetState::Reused.is_built());
        assert!(TargetState::Tested.is_built());
        assert!(!TargetState::Failed.is_built());
        assert!(!TargetState::Stopped.is_built());
        assert!(!TargetState::Building.is_built());
    }

    #[test]
    fn done_includes_failures() {
        assert!(TargetState::Failed.is_done());
        assert!(TargetState::Stopped.is_done());
        assert!(!TargetState::Pending.is_done());
    }
}
