//! Path prefix substitution between caller and server filesystems.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ordered `(local prefix, remote prefix)` substitutions.
///
/// Serialized as `[[local, remote], ...]`. The first matching prefix wins; a
/// prefix only matches on a path-component boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemapPairs(Vec<(String, String)>);

impl RemapPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a substitution. Earlier pairs take precedence.
    pub fn with(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.0.push((local.into(), remote.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    /// Translate a path string. Unmatched paths are returned unchanged.
    pub fn apply_str(&self, path: &str) -> String {
        let normalized = path.replace('\\', "/");
        for (local, remote) in &self.0 {
            let local = local.replace('\\', "/");
            let local = local.trim_end_matches('/');
            if local.is_empty() {
                continue;
            }
            if let Some(rest) = normalized.strip_prefix(local) {
                if rest.is_empty() || rest.starts_with('/') {
                    return format!("{}{}", remote.trim_end_matches(['/', '\\']), rest);
                }
            }
        }
        path.to_string()
    }

    pub fn apply(&self, path: &Path) -> PathBuf {
        PathBuf::from(self.apply_str(&path.to_string_lossy()))
    }
}

impl From<Vec<(String, String)>> for RemapPairs {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for RemapPairs {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(l, r)| (l.to_string(), r.to_string()))
                .collect(),
        )
    }
}
