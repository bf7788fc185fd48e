//! Git package URIs.
//!
//! A package URI names a repository, the ref to read from, and an optional
//! package directory inside the repository:
//!
//! ```text
//! https://github.com/acme/infra?ref=main&pkg=apps/web
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing a package URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPackageUri {
    #[error("invalid git package uri {0:?}: query params are missing")]
    MissingQuery(String),

    #[error("invalid git package uri {0:?}: missing ref query param")]
    MissingRef(String),

    #[error("invalid git package uri {0:?}: empty repository")]
    EmptyRepo(String),

    #[error("invalid git package uri {0:?}: pkg must be a relative path without `..`")]
    UnsafePkg(String),
}

/// A repository, ref and package path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageUri {
    /// Repository URL without a trailing `.git`.
    pub repo: String,
    /// Branch, tag or commit to read from.
    pub git_ref: String,
    /// Package directory relative to the repository root. Empty for the root.
    pub pkg: String,
}

impl PackageUri {
    pub fn new(repo: impl Into<String>, git_ref: impl Into<String>, pkg: impl Into<String>) -> Self {
        PackageUri {
            repo: repo.into(),
            git_ref: git_ref.into(),
            pkg: pkg.into(),
        }
    }

    /// True if `pkg` stays inside the repository: relative, and made only
    /// of plain path segments.
    pub fn has_safe_pkg(&self) -> bool {
        Path::new(&self.pkg)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    }
}

impl FromStr for PackageUri {
    type Err = InvalidPackageUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, query) = s
            .split_once('?')
            .ok_or_else(|| InvalidPackageUri::MissingQuery(s.to_string()))?;

        let repo = repo.trim_end_matches(".git");
        if repo.is_empty() {
            return Err(InvalidPackageUri::EmptyRepo(s.to_string()));
        }

        let mut git_ref = None;
        let mut pkg = String::new();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("ref", v)) if !v.is_empty() => git_ref = Some(v.to_string()),
                Some(("pkg", v)) => pkg = v.trim_matches('/').to_string(),
                _ => {}
            }
        }

        let git_ref = git_ref.ok_or_else(|| InvalidPackageUri::MissingRef(s.to_string()))?;

        let uri = PackageUri {
            repo: repo.to_string(),
            git_ref,
            pkg,
        };
        if !uri.has_safe_pkg() {
            return Err(InvalidPackageUri::UnsafePkg(s.to_string()));
        }
        Ok(uri)
    }
}

impl TryFrom<String> for PackageUri {
    type Error = InvalidPackageUri;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PackageUri> for String {
    fn from(uri: PackageUri) -> Self {
        uri.to_string()
    }
}

impl fmt::Display for PackageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?ref={}", self.repo, self.git_ref)?;
        if !self.pkg.is_empty() {
            write!(f, "&pkg={}", self.pkg)?;
        }
        Ok(())
    }
}
