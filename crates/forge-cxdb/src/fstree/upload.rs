// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use crate::client::{Client, RequestContext};
use crate::error::{Error, Result};
use crate::fs::{AttachFsRequest, AttachFsResult};

use super::options::SnapshotOption;
use super::types::Snapshot;

/// Counts of blobs actually sent during a [`Snapshot::upload`]; blobs the
/// server already had (by content hash) are skipped and not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadResult {
    pub trees_uploaded: usize,
    pub files_uploaded: usize,
}

impl Snapshot {
    /// Uploads every tree object and file blob in this snapshot that the
    /// server doesn't already have, content-addressed via `put_blob`.
    pub fn upload(&self, ctx: &RequestContext, client: &Client) -> Result<UploadResult> {
        let mut result = UploadResult::default();

        for data in self.trees.values() {
            let (_, was_new) = client.put_blob_if_absent(ctx, data.clone())?;
            if was_new {
                result.trees_uploaded += 1;
            }
        }

        for file_ref in self.files.values() {
            let data = std::fs::read(&file_ref.path)?;
            let (_, was_new) = client.put_blob_if_absent(ctx, data)?;
            if was_new {
                result.files_uploaded += 1;
            }
        }

        Ok(result)
    }
}

/// Captures `root` and immediately uploads every blob it references.
pub fn capture_and_upload(
    root: impl AsRef<Path>,
    opts: Vec<SnapshotOption>,
    ctx: &RequestContext,
    client: &Client,
) -> Result<(Snapshot, UploadResult)> {
    let snapshot = super::capture::capture(root, opts)
        .map_err(|err| Error::invalid_response(err.to_string()))?;
    let upload = snapshot.upload(ctx, client)?;
    Ok((snapshot, upload))
}

/// Uploads `snapshot`'s blobs and attaches its root to `turn_id`.
pub fn upload_and_attach(
    snapshot: &Snapshot,
    turn_id: u64,
    ctx: &RequestContext,
    client: &Client,
) -> Result<(UploadResult, AttachFsResult)> {
    let upload = snapshot.upload(ctx, client)?;
    let attach = client.attach_fs(
        ctx,
        &AttachFsRequest {
            turn_id,
            fs_root_hash: snapshot.root_hash,
        },
    )?;
    Ok((upload, attach))
}
