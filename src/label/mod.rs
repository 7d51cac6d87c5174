//! Canonical identifiers for build targets and packages.
//!
//! A [`BuildLabel`] names one target as `(subrepo, package, name)`, written
//! `//package:name` (or `///subrepo//package:name`). Two wildcard forms
//! exist: `//package:all` covers every non-internal target in the package and
//! `//package/...` covers the whole package tree rooted there. Names starting
//! with `_` are internal and never matched by wildcards; the form
//! `_<parent>#<suffix>` relates an internal target back to its parent.

pub mod input;

pub use input::BuildInput;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The name matching every non-internal target of one package.
pub const ALL_TARGETS: &str = "all";
/// The name matching every package under a directory tree.
pub const ALL_SUBPACKAGES: &str = "...";

/// Error produced when a label fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelParseError {
    input: String,
    reason: &'static str,
}

impl LabelParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_owned(),
            reason,
        }
    }
}

impl fmt::Display for LabelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid build label {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for LabelParseError {}

/// Identifies one package: its subrepo (if any) and its path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageName {
    /// Owning subrepo, if the package is not in the host repo.
    pub subrepo: Option<String>,
    /// Package path relative to the repo root; empty for the root package.
    pub package: String,
}

impl PackageName {
    /// Creates a host-repo package name.
    #[must_use]
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            subrepo: None,
            package: package.into(),
        }
    }

    /// Label for one target in this package.
    #[must_use]
    pub fn label(&self, name: impl Into<String>) -> BuildLabel {
        BuildLabel {
            subrepo: self.subrepo.clone(),
            package: self.package.clone(),
            name: name.into(),
        }
    }

    /// Returns true if this package sits at or below `root`'s directory.
    #[must_use]
    pub fn is_under(&self, root: &PackageName) -> bool {
        self.subrepo == root.subrepo
            && (root.package.is_empty()
                || self.package == root.package
                || self
                    .package
                    .strip_prefix(&root.package)
                    .is_some_and(|rest| rest.starts_with('/')))
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(subrepo) = &self.subrepo {
            write!(f, "///{subrepo}")?;
        }
        write!(f, "//{}", self.package)
    }
}

impl fmt::Debug for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageName({self})")
    }
}

/// Canonical identifier of a build target.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildLabel {
    /// Owning subrepo, if any.
    pub subrepo: Option<String>,
    /// Package path relative to the repo root.
    pub package: String,
    /// Target name within the package.
    pub name: String,
}

impl BuildLabel {
    /// Creates a host-repo label.
    #[must_use]
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subrepo: None,
            package: package.into(),
            name: name.into(),
        }
    }

    /// Sets the subrepo.
    #[must_use]
    pub fn with_subrepo(mut self, subrepo: impl Into<String>) -> Self {
        self.subrepo = Some(subrepo.into());
        self
    }

    /// The package this label belongs to.
    #[must_use]
    pub fn package_name(&self) -> PackageName {
        PackageName {
            subrepo: self.subrepo.clone(),
            package: self.package.clone(),
        }
    }

    /// True for `:all` labels.
    #[must_use]
    pub fn is_all_targets(&self) -> bool {
        self.name == ALL_TARGETS
    }

    /// True for `/...` labels.
    #[must_use]
    pub fn is_all_subpackages(&self) -> bool {
        self.name == ALL_SUBPACKAGES
    }

    /// True for either wildcard form.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.is_all_targets() || self.is_all_subpackages()
    }

    /// Internal targets are named with a leading underscore and are excluded
    /// from wildcard matches.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.name.starts_with('_')
    }

    /// Maps an internal `_<parent>#<suffix>` name back to its parent label.
    /// Returns `None` when the name does not follow that form.
    #[must_use]
    pub fn parent(&self) -> Option<BuildLabel> {
        let stripped = self.name.strip_prefix('_')?;
        let (parent, _suffix) = stripped.split_once('#')?;
        if parent.is_empty() {
            return None;
        }
        Some(BuildLabel {
            subrepo: self.subrepo.clone(),
            package: self.package.clone(),
            name: parent.to_owned(),
        })
    }

    /// Parses an absolute label: `//pkg:name`, `//pkg` (name defaults to the
    /// last path component), `//pkg/...`, or `///subrepo//pkg:name`.
    pub fn parse(input: &str) -> Result<Self, LabelParseError> {
        Self::parse_in_package(input, None)
    }

    /// Parses a label that may be relative (`:name` or a bare name) to
    /// `package`.
    pub fn parse_relative(input: &str, package: &PackageName) -> Result<Self, LabelParseError> {
        Self::parse_in_package(input, Some(package))
    }

    fn parse_in_package(
        input: &str,
        package: Option<&PackageName>,
    ) -> Result<Self, LabelParseError> {
        let err = |reason| Err(LabelParseError::new(input, reason));
        if input.is_empty() {
            return err("empty label");
        }
        if input.contains(char::is_whitespace) {
            return err("labels cannot contain whitespace");
        }

        let (subrepo, rest) = if let Some(rest) = input.strip_prefix("///") {
            let Some((subrepo, rest)) = rest.split_once("//") else {
                return err("subrepo labels look like ///subrepo//pkg:name");
            };
            if subrepo.is_empty() {
                return err("empty subrepo name");
            }
            (Some(subrepo.to_owned()), rest)
        } else if let Some(rest) = input.strip_prefix("//") {
            (None, rest)
        } else {
            // Relative to the current package.
            let Some(package) = package else {
                return err("relative labels need a package context");
            };
            let name = input.strip_prefix(':').unwrap_or(input);
            return Self::validate(BuildLabel {
                subrepo: package.subrepo.clone(),
                package: package.package.clone(),
                name: name.to_owned(),
            })
            .map_err(|reason| LabelParseError::new(input, reason));
        };

        let label = if let Some((pkg, name)) = rest.split_once(':') {
            BuildLabel {
                subrepo,
                package: pkg.to_owned(),
                name: name.to_owned(),
            }
        } else if let Some(pkg) = rest
            .strip_suffix("/...")
            .or(if rest == ALL_SUBPACKAGES { Some("") } else { None })
        {
            BuildLabel {
                subrepo,
                package: pkg.to_owned(),
                name: ALL_SUBPACKAGES.to_owned(),
            }
        } else {
            // //pkg is shorthand for //pkg:<last component>.
            let name = rest.rsplit('/').next().unwrap_or(rest);
            if name.is_empty() {
                return err("label has no target name");
            }
            BuildLabel {
                subrepo,
                package: rest.to_owned(),
                name: name.to_owned(),
            }
        };
        Self::validate(label).map_err(|reason| LabelParseError::new(input, reason))
    }

    fn validate(label: BuildLabel) -> Result<BuildLabel, &'static str> {
        if label.name.is_empty() {
            return Err("label has no target name");
        }
        if label.package.starts_with('/') || label.package.ends_with('/') {
            return Err("package paths cannot begin or end with a slash");
        }
        if label.package.contains("//") {
            return Err("package paths cannot contain //");
        }
        Ok(label)
    }
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(subrepo) = &self.subrepo {
            write!(f, "///{subrepo}")?;
        }
        if self.is_all_subpackages() {
            if self.package.is_empty() {
                write!(f, "//...")
            } else {
                write!(f, "//{}/...", self.package)
            }
        } else {
            write!(f, "//{}:{}", self.package, self.name)
        }
    }
}

impl fmt::Debug for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildLabel({self})")
    }
}

impl std::str::FromStr for BuildLabel {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
