// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

#![allow(non_upper_case_globals)]

//! Walks a directory into a content-addressed [`Snapshot`]: every file is
//! hashed with blake3, every directory serializes its sorted children into a
//! [`TreeObject`] that is itself hashed, so two captures of identical content
//! produce the same `root_hash` regardless of read order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use super::options::{apply_options, Options, SnapshotOption};
use super::types::{
    EntryKindDirectory, EntryKindFile, EntryKindSymlink, FileRef, Snapshot, SnapshotStats,
    TreeEntry, TreeObject,
};

pub type Result<T> = std::result::Result<T, FstreeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FstreeErrorKind {
    Io,
    CyclicLink,
    FileTooLarge,
    TooManyFiles,
    Other,
}

pub const ErrCyclicLink: FstreeErrorKind = FstreeErrorKind::CyclicLink;
pub const ErrFileTooLarge: FstreeErrorKind = FstreeErrorKind::FileTooLarge;
pub const ErrTooManyFiles: FstreeErrorKind = FstreeErrorKind::TooManyFiles;

#[derive(Debug)]
pub struct FstreeError {
    pub kind: FstreeErrorKind,
    pub message: String,
}

impl FstreeError {
    pub fn new(kind: FstreeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FstreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FstreeError {}

impl From<std::io::Error> for FstreeError {
    fn from(err: std::io::Error) -> Self {
        FstreeError::new(FstreeErrorKind::Io, err.to_string())
    }
}

struct CaptureState {
    snapshot: Snapshot,
    max_files: usize,
}

/// Captures `root` into a [`Snapshot`], applying `opts`.
pub fn capture(root: impl AsRef<Path>, opts: Vec<SnapshotOption>) -> Result<Snapshot> {
    let root = root.as_ref();
    let options = apply_options(opts);
    let start = Instant::now();

    let mut state = CaptureState {
        snapshot: Snapshot {
            root_hash: [0u8; 32],
            trees: HashMap::new(),
            files: HashMap::new(),
            symlinks: HashMap::new(),
            stats: SnapshotStats::default(),
            captured_at: SystemTime::now(),
        },
        max_files: options.max_files,
    };
    state.snapshot.stats.dir_count += 1;

    let canonical_root = fs::canonicalize(root)?;
    let mut ancestors = vec![canonical_root];
    let (root_hash, _) = walk_dir(root, Path::new(""), &mut ancestors, &options, &mut state)?;
    state.snapshot.root_hash = root_hash;
    state.snapshot.stats.duration = start.elapsed();
    Ok(state.snapshot)
}

fn walk_dir(
    dir: &Path,
    rel_prefix: &Path,
    ancestors: &mut Vec<PathBuf>,
    options: &Options,
    state: &mut CaptureState,
) -> Result<([u8; 32], Vec<u8>)> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut tree_entries = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if options.is_excluded(&name, &path) {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            if options.follow_symlinks {
                let target_meta = fs::metadata(&path)?;
                if target_meta.is_dir() {
                    let canonical = fs::canonicalize(&path)?;
                    if ancestors.contains(&canonical) {
                        return Err(FstreeError::new(
                            ErrCyclicLink,
                            format!("cyclic symlink at {}", path.display()),
                        ));
                    }
                    ancestors.push(canonical);
                    let child_prefix = rel_prefix.join(&name);
                    let (hash, _) = walk_dir(&path, &child_prefix, ancestors, options, state)?;
                    ancestors.pop();
                    tree_entries.push(TreeEntry {
                        name,
                        kind: EntryKindDirectory,
                        mode: mode_bits(&target_meta),
                        size: 0,
                        hash,
                    });
                } else {
                    let size = target_meta.len();
                    if size > options.max_file_size {
                        continue;
                    }
                    let hash = capture_file(&path, size, state)?;
                    tree_entries.push(TreeEntry {
                        name,
                        kind: EntryKindFile,
                        mode: mode_bits(&target_meta),
                        size,
                        hash,
                    });
                }
            } else {
                let target = fs::read_link(&path)?;
                let target_str = target.to_string_lossy().into_owned();
                let hash = *blake3::hash(target_str.as_bytes()).as_bytes();
                state.snapshot.symlinks.insert(hash, target_str);
                state.snapshot.stats.symlink_count += 1;
                let meta = entry.metadata()?;
                tree_entries.push(TreeEntry {
                    name,
                    kind: EntryKindSymlink,
                    mode: mode_bits(&meta),
                    size: 0,
                    hash,
                });
            }
            continue;
        }

        if file_type.is_dir() {
            let canonical = fs::canonicalize(&path)?;
            ancestors.push(canonical);
            let child_prefix = rel_prefix.join(&name);
            let (hash, _) = walk_dir(&path, &child_prefix, ancestors, options, state)?;
            ancestors.pop();
            let meta = entry.metadata()?;
            state.snapshot.stats.dir_count += 1;
            tree_entries.push(TreeEntry {
                name,
                kind: EntryKindDirectory,
                mode: mode_bits(&meta),
                size: 0,
                hash,
            });
            continue;
        }

        let meta = entry.metadata()?;
        let size = meta.len();
        if size > options.max_file_size {
            continue;
        }
        let hash = capture_file(&path, size, state)?;
        tree_entries.push(TreeEntry {
            name,
            kind: EntryKindFile,
            mode: mode_bits(&meta),
            size,
            hash,
        });
    }

    let tree_object = TreeObject {
        entries: tree_entries,
    };
    let data = rmp_serde::to_vec(&tree_object)
        .map_err(|err| FstreeError::new(FstreeErrorKind::Other, err.to_string()))?;
    let hash = *blake3::hash(&data).as_bytes();
    state.snapshot.trees.insert(hash, data.clone());
    Ok((hash, data))
}

fn capture_file(path: &Path, size: u64, state: &mut CaptureState) -> Result<[u8; 32]> {
    state.snapshot.stats.file_count += 1;
    if state.snapshot.stats.file_count > state.max_files {
        return Err(FstreeError::new(ErrTooManyFiles, "too many files"));
    }

    let hash = hash_file(path)?;
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    state
        .snapshot
        .files
        .entry(hash)
        .or_insert_with(|| FileRef {
            path: canonical,
            size,
            hash,
        });
    state.snapshot.stats.total_bytes += size;
    Ok(hash)
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &fs::Metadata) -> u32 {
    0o644
}

/// Decodes a serialized [`TreeObject`] back into its entries.
pub fn deserialize_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let tree: TreeObject = rmp_serde::from_slice(data)
        .map_err(|err| FstreeError::new(FstreeErrorKind::Other, err.to_string()))?;
    Ok(tree.entries)
}
