//! Build results, test results, and the error taxonomy.

use crate::label::BuildLabel;
use std::time::Duration;
use thiserror::Error;

/// Why a unit of work failed.
///
/// Cache and transient-network problems never appear here; they are logged
/// and degraded to the build path. Structural graph defects abort the
/// process instead of being reported. What remains is attributable to one
/// label and flows through the results channel.
#[derive(Debug, Error, Clone)]
pub enum BuildError {
    /// The build-file interpreter raised while parsing a package.
    #[error("parse of {label} failed: {reason}")]
    ParseFailed {
        /// Label whose parse was requested.
        label: BuildLabel,
        /// Interpreter-supplied reason.
        reason: String,
    },
    /// The build command exited non-zero.
    #[error("build of {label} failed: {reason}")]
    TargetBuildFailed {
        /// The failing target.
        label: BuildLabel,
        /// What went wrong.
        reason: String,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
    /// The build or test command overran its timeout.
    #[error("{label}: Timeout exceeded: {stderr}")]
    Timeout {
        /// The target that timed out.
        label: BuildLabel,
        /// Stderr accumulated before the kill.
        stderr: String,
    },
    /// The test command reported failures.
    #[error("tests of {label} failed: {reason}")]
    TargetTestFailed {
        /// The failing target.
        label: BuildLabel,
        /// What went wrong.
        reason: String,
        /// Captured test output.
        output: String,
    },
    /// A lint step reported failures; does not block unrelated targets.
    #[error("lint of {label} failed: {reason}")]
    TargetLintFailed {
        /// The failing target.
        label: BuildLabel,
        /// What went wrong.
        reason: String,
    },
    /// A dependency can never be satisfied (e.g. not visible).
    #[error("{label} cannot depend on {dep}: {reason}")]
    BadDependency {
        /// The dependent target.
        label: BuildLabel,
        /// The dependency at fault.
        dep: BuildLabel,
        /// Why the edge is invalid.
        reason: String,
    },
    /// The authoritative cache failed to produce artifacts.
    #[error("cache retrieval for {label} failed: {reason}")]
    CacheFailed {
        /// The target whose retrieval failed.
        label: BuildLabel,
        /// What went wrong.
        reason: String,
    },
}

impl BuildError {
    /// The label this failure is attributed to.
    #[must_use]
    pub fn label(&self) -> &BuildLabel {
        match self {
            Self::ParseFailed { label, .. }
            | Self::TargetBuildFailed { label, .. }
            | Self::Timeout { label, .. }
            | Self::TargetTestFailed { label, .. }
            | Self::TargetLintFailed { label, .. }
            | Self::BadDependency { label, .. }
            | Self::CacheFailed { label, .. } => label,
        }
    }
}

/// What happened to one unit of work; emitted on the results channel.
#[derive(Debug, Clone)]
pub enum BuildResult {
    /// A package parsed successfully.
    PackageParsed {
        /// The parsed package's originating label.
        label: BuildLabel,
    },
    /// A target finished building.
    TargetBuilt {
        /// The target.
        label: BuildLabel,
        /// Terminal state: Built, Cached, Unchanged, Reused or
        /// BuiltRemotely.
        state: crate::graph::TargetState,
    },
    /// A target's tests passed.
    TargetTested {
        /// The target.
        label: BuildLabel,
        /// Its recorded results.
        results: TestResults,
    },
    /// A unit of work failed.
    Failed(BuildError),
}

/// Outcome of a test run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TestResults {
    /// Total number of test cases observed.
    pub num_tests: usize,
    /// How many passed.
    pub passed: usize,
    /// How many failed.
    pub failed: usize,
    /// How many were skipped.
    pub skipped: usize,
    /// Wall-clock duration of the run.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Captured output.
    pub output: String,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?))
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Targets that reached a built state, in no particular order.
    pub built: Vec<BuildLabel>,
    /// Of those, how many came from a cache.
    pub cached: usize,
    /// Of those, how many were reused or unchanged.
    pub reused: usize,
    /// Targets whose tests passed.
    pub tested: Vec<BuildLabel>,
    /// Failures, in arrival order.
    pub failed: Vec<BuildError>,
    /// Targets that never built because a dependency failed.
    pub blocked: Vec<BuildLabel>,
}

impl BuildSummary {
    /// True when nothing failed and nothing was left blocked.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_their_label() {
        let label = BuildLabel::new("pkg", "lib");
        let err = BuildError::TargetBuildFailed {
            label: label.clone(),
            reason: "exit status 1".into(),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(err.label(), &label);
        assert!(err.to_string().contains("//pkg:lib"));
    }

    #[test]
    fn timeout_message_format() {
        let err = BuildError::Timeout {
            label: BuildLabel::new("pkg", "slow"),
            stderr: "still going".into(),
        };
        assert!(err.to_string().contains("Timeout exceeded"));
        assert!(err.to_string().contains("still going"));
    }

    #[test]
    fn summary_success_requires_no_failures_or_blocked() {
        let mut summary = BuildSummary::default();
        assert!(summary.success());
        summary.blocked.push(BuildLabel::new("pkg", "stuck"));
        assert!(!summary.success());
    }

    #[test]
    fn test_results_roundtrip_json() {
        let results = TestResults {
            num_tests: 3,
            passed: 2,
            failed: 1,
            skipped: 0,
            duration: Duration::from_millis(1500),
            output: "1 failure".into(),
        };
        let json = serde_json::to_string(&results).unwrap();
        let back: TestResults = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_tests, 3);
        assert_eq!(back.failed, 1);
        assert!((back.duration.as_secs_f64() - 1.5).abs() < 1e-9);
    }
}
