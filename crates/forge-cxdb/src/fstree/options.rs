// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

/// Accumulated capture configuration built from a [`Vec<SnapshotOption>`] by
/// [`apply_options`]. Not constructed directly outside this crate.
#[derive(Clone)]
pub struct Options {
    pub(crate) exclude_patterns: Vec<String>,
    pub(crate) exclude_func: Option<Arc<dyn Fn(&Path) -> bool + Send + Sync>>,
    pub(crate) follow_symlinks: bool,
    pub(crate) max_file_size: u64,
    pub(crate) max_files: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            exclude_func: None,
            follow_symlinks: false,
            max_file_size: u64::MAX,
            max_files: usize::MAX,
        }
    }
}

/// A functional option configuring a [`crate::fstree::capture`] call.
#[derive(Clone)]
pub struct SnapshotOption(SnapshotOptionKind);

#[derive(Clone)]
enum SnapshotOptionKind {
    Exclude(Vec<String>),
    ExcludeFunc(Arc<dyn Fn(&Path) -> bool + Send + Sync>),
    FollowSymlinks,
    MaxFileSize(u64),
    MaxFiles(usize),
}

/// Excludes entries whose basename matches any of `patterns` (glob syntax,
/// e.g. `"*.log"`). A directory match prunes the whole subtree.
pub fn with_exclude<S: Into<String>>(patterns: Vec<S>) -> SnapshotOption {
    SnapshotOption(SnapshotOptionKind::Exclude(
        patterns.into_iter().map(Into::into).collect(),
    ))
}

pub fn with_exclude_func(f: impl Fn(&Path) -> bool + Send + Sync + 'static) -> SnapshotOption {
    SnapshotOption(SnapshotOptionKind::ExcludeFunc(Arc::new(f)))
}

/// Follows symlinked directories instead of recording them as opaque
/// symlink entries. Enables cycle detection.
pub fn with_follow_symlinks() -> SnapshotOption {
    SnapshotOption(SnapshotOptionKind::FollowSymlinks)
}

/// Files larger than `size` bytes are silently skipped, not errored.
pub fn with_max_file_size(size: u64) -> SnapshotOption {
    SnapshotOption(SnapshotOptionKind::MaxFileSize(size))
}

/// Capture fails with [`crate::fstree::ErrTooManyFiles`] once more than `n`
/// files have been seen.
pub fn with_max_files(n: usize) -> SnapshotOption {
    SnapshotOption(SnapshotOptionKind::MaxFiles(n))
}

pub(crate) fn apply_options(opts: Vec<SnapshotOption>) -> Options {
    let mut options = Options::default();
    for opt in opts {
        match opt.0 {
            SnapshotOptionKind::Exclude(patterns) => options.exclude_patterns.extend(patterns),
            SnapshotOptionKind::ExcludeFunc(f) => options.exclude_func = Some(f),
            SnapshotOptionKind::FollowSymlinks => options.follow_symlinks = true,
            SnapshotOptionKind::MaxFileSize(size) => options.max_file_size = size,
            SnapshotOptionKind::MaxFiles(n) => options.max_files = n,
        }
    }
    options
}

impl Options {
    pub(crate) fn is_excluded(&self, name: &str, path: &Path) -> bool {
        if let Some(f) = &self.exclude_func {
            if f(path) {
                return true;
            }
        }
        self.exclude_patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|compiled| compiled.matches(name))
                .unwrap_or(false)
        })
    }
}
