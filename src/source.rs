//! Source asset resolution
//!
//! Maps logical asset names onto files under configured source roots.
//! Roots are searched highest priority first; a root with a mount point
//! only participates when the queried name starts with that prefix.

use std::path::{Path, PathBuf};

/// One source directory participating in resolution.
#[derive(Debug, Clone, Default)]
pub struct SourceMountConfig {
    pub root_path: PathBuf,
    /// Higher priority roots are searched first.
    pub priority: i32,
    /// Virtual prefix, e.g. `"dlc1/"`. Empty matches every name.
    pub mount_point: String,
}

/// A resolved source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub absolute_path: PathBuf,
    /// What the caller queries by; kept verbatim, prefix included.
    pub logical_name: String,
}

/// Priority-ordered list of source roots.
#[derive(Default)]
pub struct SourceAssetResolver {
    roots: Vec<SourceMountConfig>,
}

impl SourceAssetResolver {
    pub fn new() -> Self {
        SourceAssetResolver::default()
    }

    pub fn add_root(&mut self, config: SourceMountConfig) {
        self.roots.push(config);
        // Stable sort keeps insertion order among equal priorities.
        self.roots.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    pub fn remove_root(&mut self, root_path: impl AsRef<Path>) {
        let root_path = root_path.as_ref();
        self.roots.retain(|r| r.root_path != root_path);
    }

    pub fn roots(&self) -> &[SourceMountConfig] {
        &self.roots
    }

    /// Find the file backing a logical name, or `None` when no root has
    /// it.
    pub fn resolve(&self, name: &str) -> Option<ResolvedSource> {
        for root in &self.roots {
            let lookup = if root.mount_point.is_empty() {
                name
            } else if let Some(stripped) = name.strip_prefix(&root.mount_point) {
                stripped
            } else {
                continue;
            };

            let full_path = root.root_path.join(lookup);
            if full_path.is_file() {
                return Some(ResolvedSource {
                    absolute_path: full_path,
                    logical_name: name.to_string(),
                });
            }
        }
        None
    }
}
