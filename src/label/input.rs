//! Inputs a target can consume: source files, other targets' outputs, or
//! absolute system files.

use super::BuildLabel;
use crate::config::Config;
use crate::graph::BuildGraph;
use std::fmt;
use std::path::PathBuf;

/// One input to a build rule.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum BuildInput {
    /// A source file within a package.
    File {
        /// Package path the file belongs to.
        package: String,
        /// Filename relative to the package directory.
        file: String,
    },
    /// The sole output of another target.
    Target(BuildLabel),
    /// A named sub-output of another target.
    NamedOutput {
        /// The producing target.
        label: BuildLabel,
        /// Which of its named output groups.
        output: String,
    },
    /// An absolute external path, consumed read-only.
    System {
        /// Absolute path outside the repo.
        path: PathBuf,
    },
}

impl BuildInput {
    /// The target this input depends on, if it is produced by one.
    #[must_use]
    pub fn label(&self) -> Option<&BuildLabel> {
        match self {
            Self::Target(label) | Self::NamedOutput { label, .. } => Some(label),
            Self::File { .. } | Self::System { .. } => None,
        }
    }

    /// Resolves this input to the concrete paths the build command reads.
    /// Target-produced inputs resolve to the producer's paths in the output
    /// tree; unknown producers resolve to nothing (the scheduler guarantees
    /// they are built first on any path that matters).
    #[must_use]
    pub fn paths(&self, graph: &BuildGraph, config: &Config) -> Vec<PathBuf> {
        match self {
            Self::File { package, file } => {
                let mut path = PathBuf::from(package);
                path.push(file);
                vec![path]
            }
            Self::Target(label) => graph
                .target(label)
                .map(|t| t.output_paths(config))
                .unwrap_or_default(),
            Self::NamedOutput { label, output } => graph
                .target(label)
                .map(|t| t.named_output_paths(output, config))
                .unwrap_or_default(),
            Self::System { path } => vec![path.clone()],
        }
    }
}

impl fmt::Display for BuildInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { package, file } => write!(f, "//{package}/{file}"),
            Self::Target(label) => write!(f, "{label}"),
            Self::NamedOutput { label, output } => write!(f, "{label}|{output}"),
            Self::System { path } => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_only_for_target_inputs() {
        let l = BuildLabel::new("pkg", "lib");
        assert_eq!(BuildInput::Target(l.clone()).label(), Some(&l));
        assert_eq!(
            BuildInput::NamedOutput {
                label: l.clone(),
                output: "hdrs".into()
            }
            .label(),
            Some(&l)
        );
        assert_eq!(
            BuildInput::File {
                package: "pkg".into(),
                file: "a.c".into()
            }
            .label(),
            None
        );
        assert_eq!(
            BuildInput::System {
                path: "/usr/bin/cc".into()
            }
            .label(),
            None
        );
    }

    #[test]
    fn display_forms() {
        assert_eq!(
            BuildInput::File {
                package: "src".into(),
                file: "main.c".into()
            }
            .to_string(),
            "//src/main.c"
        );
        assert_eq!(
            BuildInput::NamedOutput {
                label: BuildLabel::new("pkg", "lib"),
                output: "hdrs".into()
            }
            .to_string(),
            "//pkg:lib|hdrs"
        );
    }
}
