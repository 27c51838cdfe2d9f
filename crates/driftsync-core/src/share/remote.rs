//! Integration of remote manifest records.
//!
//! Vector clocks decide what happens to an incoming record: strict
//! descendants of our row replace it, ancestors are ignored, and concurrent
//! versions become conflicts. A conflict keeps the local row untouched and
//! files the remote version under a sibling path, so both versions stay
//! visible after its content arrives.

use std::{fs, path::Path};

use driftsync_proto::FileRecord;

use super::{MFile, Share};
use crate::{errors::ShareError, vclock::VClock};

/// Content the protocol should fetch after applying a remote record:
/// `checksum` names the bytes, `path` is where they will be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    /// Lowercase hex SHA-256 of the wanted content
    pub checksum: String,
    /// Manifest-relative destination path
    pub path: String,
}

/// What [`Share::apply_remote_update`] did with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The record was stored (new row, or it superseded ours).
    Applied {
        /// Content to fetch, when the record is not a tombstone and we do
        /// not already hold its bytes
        fetch: Option<FetchPlan>,
    },

    /// Our row already supersedes the record; nothing changed.
    Ignored,

    /// Concurrent versions. The local row is kept; the remote version was
    /// filed under the sibling path in the plan.
    Conflict {
        /// Content fetch for the conflict copy
        fetch: FetchPlan,
    },
}

/// Sibling path for a conflicting version:
/// `<stem>.<peer_id>.<last_changed_rev>.<ext>`.
fn conflict_path(path: &str, peer_id: &str, rev: u64) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{dir}{stem}.{peer_id}.{rev}.{ext}")
        },
        _ => format!("{dir}{name}.{peer_id}.{rev}"),
    }
}

/// Manifest row holding a remote record's metadata. Tombstone shape is
/// enforced here so malformed records cannot violate row invariants.
fn row_from_record(path: &str, record: &FileRecord, vclock: VClock) -> MFile {
    MFile {
        path: path.to_string(),
        mtime: record.mtime.clone(),
        size: if record.deleted { 0 } else { record.size },
        mode: if record.deleted { 0 } else { record.mode },
        scan_found: false,
        deleted: record.deleted,
        to_checksum: false,
        checksum: if record.deleted { String::new() } else { record.checksum.clone() },
        last_changed_rev: record.last_changed_rev,
        last_changed_by: record.last_changed_by.clone(),
        vclock,
        updated: false,
    }
}

impl Share {
    /// Apply one record from a peer's `Update` message.
    pub fn apply_remote_update(
        &mut self,
        record: &FileRecord,
    ) -> Result<RemoteOutcome, ShareError> {
        let path = record.path().to_string();
        let remote_clock = VClock::from_map(record.vclock.clone());

        let Some(local) = self.get_by_path(&path)? else {
            // First sighting of this path: accept as-is.
            self.insert_mfile(&row_from_record(&path, record, remote_clock))?;
            let fetch = (!record.deleted && !record.checksum.is_empty())
                .then(|| FetchPlan { checksum: record.checksum.clone(), path });
            return Ok(RemoteOutcome::Applied { fetch });
        };

        if local.vclock.is_descendant(&remote_clock) {
            // Covers equality: we already have this version or a newer one.
            return Ok(RemoteOutcome::Ignored);
        }

        if remote_clock.is_descendant(&local.vclock) {
            let fetch = (!record.deleted
                && !record.checksum.is_empty()
                && record.checksum != local.checksum)
                .then(|| FetchPlan { checksum: record.checksum.clone(), path: path.clone() });
            self.update_mfile(&row_from_record(&path, record, remote_clock))?;
            tracing::debug!(share_id = %self.share_id, %path, "remote version superseded local");
            return Ok(RemoteOutcome::Applied { fetch });
        }

        // Concurrent edits. A remote deletion loses to our live copy; a
        // remote edit is kept as a visible conflict sibling.
        if record.deleted || record.checksum.is_empty() {
            tracing::info!(
                share_id = %self.share_id,
                %path,
                "conflicting remote tombstone ignored, keeping local copy"
            );
            return Ok(RemoteOutcome::Ignored);
        }

        let sibling = conflict_path(&path, &record.last_changed_by, record.last_changed_rev);
        self.upsert_mfile(&row_from_record(&sibling, record, remote_clock))?;
        tracing::info!(share_id = %self.share_id, %path, %sibling, "conflict detected");
        Ok(RemoteOutcome::Conflict {
            fetch: FetchPlan { checksum: record.checksum.clone(), path: sibling },
        })
    }

    /// Commit verified fetched content into the share.
    ///
    /// The caller has already checked the SHA-256 of `staged` against
    /// `plan.checksum`. The file is moved from quarantine into place and the
    /// row refreshed from the resulting on-disk state so the next scan sees
    /// it unchanged.
    pub fn commit_fetched(&mut self, staged: &Path, plan: &FetchPlan) -> Result<(), ShareError> {
        let dest = self.fullpath(&plan.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        // Quarantine may live on a different filesystem than the share.
        if fs::rename(staged, &dest).is_err() {
            fs::copy(staged, &dest)?;
            fs::remove_file(staged)?;
        }

        let Some(mut row) = self.get_by_path(&plan.path)? else {
            tracing::warn!(path = %plan.path, "fetched content for a row that no longer exists");
            return Ok(());
        };

        let metadata = fs::metadata(&dest)?;
        row.mtime = metadata.modified().map(crate::time::isotime).unwrap_or_default();
        row.size = metadata.len();
        row.mode = super::mode_bits(&metadata);
        row.checksum = plan.checksum.clone();
        row.to_checksum = false;
        self.update_mfile(&row)?;

        tracing::debug!(share_id = %self.share_id, path = %plan.path, "fetched content committed");
        Ok(())
    }
}
