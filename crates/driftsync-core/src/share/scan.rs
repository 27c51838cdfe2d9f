//! Cooperative filesystem scan and checksum pipeline.
//!
//! A scan runs in bounded ticks so the event loop never stalls: each
//! [`Share::scan_step`] advances the directory walk by at most
//! [`SCAN_BATCH_SIZE`] entries and hashes at most [`CKSUM_BATCH_SIZE`] ×
//! [`CKSUM_BLOCK_SIZE`] bytes. The two passes interleave; the checksummer
//! re-queries its work list before each file so entries queued by the same
//! scan are picked up without a second round.
//!
//! When both passes run dry, every row the walk did not see becomes a
//! tombstone and `scan_found` is reset for the next scan.

use std::{fs, io::Read, time::Instant};

use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::{MFILE_COLUMNS, MFile, Share, mode_bits};
use crate::{errors::ShareError, time::isotime};

/// Directory entries examined per tick (stat budget).
pub const SCAN_BATCH_SIZE: usize = 256;

/// Blocks hashed per tick.
pub const CKSUM_BATCH_SIZE: usize = 8;

/// Bytes per hashed block.
pub const CKSUM_BLOCK_SIZE: usize = 65536;

/// In-flight checksum of one file.
pub(crate) struct CksumJob {
    mfile: MFile,
    file: fs::File,
    hasher: Sha256,
}

/// Stat results for one regular file found on disk.
struct ScanEntry {
    path: String,
    mtime: String,
    size: u64,
    mode: u32,
}

/// Manifest-relative path with forward slashes.
fn relative_path(root: &std::path::Path, path: &std::path::Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> =
        rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}

impl Share {
    /// True while a scan is running.
    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress
    }

    /// Begin a filesystem scan. Call [`Share::scan_step`] until it returns
    /// `false`.
    pub fn scan(&mut self) {
        self.scan_in_progress = true;
        self.walker = Some(WalkDir::new(&self.root).into_iter());
        self.scan_found_count = 0;
        self.scan_started = Some(Instant::now());
    }

    /// One cooperative tick of the scan/checksum pipeline.
    ///
    /// Returns `true` while either pass still has work. The finalizer runs
    /// exactly once, on the tick where both report done.
    pub fn scan_step(&mut self) -> Result<bool, ShareError> {
        if !self.scan_in_progress {
            return Ok(false);
        }

        let scan_more = self.fs_scan_step()?;
        let cksum_more = self.cksum_step()?;

        if scan_more || cksum_more {
            return Ok(true);
        }

        self.finish_scan()?;
        Ok(false)
    }

    /// Run a scan to completion. Convenience for attach-time indexing and
    /// tests; production callers tick from a timer instead.
    pub fn scan_all(&mut self) -> Result<(), ShareError> {
        self.scan();
        while self.scan_step()? {}
        Ok(())
    }

    /// Advance the directory walk by one batch.
    fn fs_scan_step(&mut self) -> Result<bool, ShareError> {
        let Some(mut walker) = self.walker.take() else {
            return Ok(false);
        };

        for _ in 0..SCAN_BATCH_SIZE {
            match walker.next() {
                Some(Ok(entry)) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Some(path) = relative_path(&self.root, entry.path()) else {
                        continue;
                    };
                    let metadata = match entry.metadata() {
                        Ok(metadata) => metadata,
                        Err(e) => {
                            tracing::warn!(%path, error = %e, "stat failed, skipping entry");
                            continue;
                        },
                    };
                    let mtime = metadata
                        .modified()
                        .map(isotime)
                        .unwrap_or_default();
                    let entry = ScanEntry {
                        path,
                        mtime,
                        size: metadata.len(),
                        mode: mode_bits(&metadata),
                    };
                    self.scan_found(&entry)?;
                },
                Some(Err(e)) => {
                    // Unreadable subtree: local fault, keep scanning the rest.
                    tracing::warn!(error = %e, "scan error, skipping entry");
                },
                None => return Ok(false),
            }
        }

        self.walker = Some(walker);
        Ok(true)
    }

    /// Reconcile one on-disk file with its manifest row.
    fn scan_found(&mut self, entry: &ScanEntry) -> Result<(), ShareError> {
        self.scan_found_count += 1;

        let Some(mut mfile) = self.get_by_path(&entry.path)? else {
            // Newly discovered file; content hash comes later, `updated` is
            // only set once the hash is known.
            let rev = self.take_revision()?;
            let mut mfile = MFile {
                path: entry.path.clone(),
                mtime: entry.mtime.clone(),
                size: entry.size,
                mode: entry.mode,
                scan_found: true,
                to_checksum: true,
                last_changed_rev: rev,
                last_changed_by: self.peer_id.clone(),
                ..MFile::default()
            };
            mfile.vclock.increment(&self.peer_id);
            self.insert_mfile(&mfile)?;
            return Ok(());
        };

        let content_changed =
            entry.mtime != mfile.mtime || entry.size != mfile.size || mfile.deleted;
        let mode_changed = entry.mode != mfile.mode;

        if !content_changed && !mode_changed {
            mfile.scan_found = true;
            self.update_mfile(&mfile)?;
            return Ok(());
        }

        mfile.mtime = entry.mtime.clone();
        mfile.size = entry.size;
        mfile.mode = entry.mode;
        mfile.scan_found = true;
        mfile.deleted = false;
        mfile.last_changed_rev = self.take_revision()?;
        mfile.last_changed_by = self.peer_id.clone();
        mfile.vclock.increment(&self.peer_id);

        if content_changed {
            mfile.to_checksum = true;
            mfile.updated = false;
        } else {
            // Mode-only change: nothing to rehash, advertise immediately.
            mfile.updated = true;
        }

        self.update_mfile(&mfile)?;
        Ok(())
    }

    /// Hash one batch of blocks.
    fn cksum_step(&mut self) -> Result<bool, ShareError> {
        let mut blocks = 0;
        while blocks < CKSUM_BATCH_SIZE {
            if self.cksum_job.is_some() {
                self.cksum_do_block()?;
                blocks += 1;
            } else if !self.cksum_next_file()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Open the next file queued for checksumming.
    ///
    /// The query reruns every time because the interleaved filesystem pass
    /// keeps queueing new work.
    fn cksum_next_file(&mut self) -> Result<bool, ShareError> {
        let sql = format!(
            "SELECT {MFILE_COLUMNS} FROM files WHERE to_checksum != 0 ORDER BY path LIMIT 1"
        );
        let mfile = {
            let mut stmt = self.db.prepare_cached(&sql)?;
            stmt.query_row([], MFile::from_row).optional()?
        };
        let Some(mut mfile) = mfile else {
            return Ok(false);
        };

        match fs::File::open(self.fullpath(&mfile.path)) {
            Ok(file) => {
                self.cksum_job = Some(CksumJob { mfile, file, hasher: Sha256::new() });
            },
            Err(e) => {
                // Vanished (or unreadable) between discovery and hashing.
                tracing::debug!(path = %mfile.path, error = %e, "file gone before checksum");
                let rev = self.take_revision()?;
                let peer_id = self.peer_id.clone();
                mfile.tombstone(&peer_id, rev);
                self.update_mfile(&mfile)?;
            },
        }
        Ok(true)
    }

    /// Read one block of the in-flight file; finalize on EOF.
    fn cksum_do_block(&mut self) -> Result<(), ShareError> {
        let Some(mut job) = self.cksum_job.take() else {
            return Ok(());
        };

        let mut buf = vec![0u8; CKSUM_BLOCK_SIZE];
        match job.file.read(&mut buf) {
            Ok(0) => {
                let mut mfile = job.mfile;
                let peer_id = self.peer_id.clone();
                if self.fullpath(&mfile.path).exists() {
                    mfile.checksum = hex::encode(job.hasher.finalize());
                    mfile.to_checksum = false;
                    mfile.updated = true;
                    mfile.last_changed_rev = self.take_revision()?;
                    mfile.last_changed_by = peer_id.clone();
                    mfile.vclock.increment(&peer_id);
                } else {
                    // Check one last time whether the file vanished while we
                    // were reading it.
                    let rev = self.take_revision()?;
                    mfile.tombstone(&peer_id, rev);
                }
                self.update_mfile(&mfile)?;
            },
            Ok(n) => {
                job.hasher.update(&buf[..n]);
                self.cksum_job = Some(job);
            },
            Err(e) => {
                tracing::warn!(path = %job.mfile.path, error = %e, "read failed mid-checksum");
                let mut mfile = job.mfile;
                let rev = self.take_revision()?;
                let peer_id = self.peer_id.clone();
                mfile.tombstone(&peer_id, rev);
                self.update_mfile(&mfile)?;
            },
        }
        Ok(())
    }

    /// Tombstone everything the walk did not see and reset per-scan state.
    fn finish_scan(&mut self) -> Result<(), ShareError> {
        let sql = format!(
            "SELECT {MFILE_COLUMNS} FROM files WHERE scan_found = 0 AND deleted = 0 \
             ORDER BY path"
        );
        let missing = {
            let mut stmt = self.db.prepare_cached(&sql)?;
            let rows = stmt.query_map([], MFile::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for mut mfile in missing {
            let rev = self.take_revision()?;
            let peer_id = self.peer_id.clone();
            mfile.tombstone(&peer_id, rev);
            self.update_mfile(&mfile)?;
        }

        self.db.execute("UPDATE files SET scan_found = 0", [])?;

        self.last_scan_duration = self.scan_started.take().map(|started| started.elapsed());
        self.scan_in_progress = false;

        tracing::info!(
            share_id = %self.share_id,
            found = self.scan_found_count,
            duration = ?self.last_scan_duration,
            "scan finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn write_file(root: &std::path::Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn sha256_hex(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    #[test]
    fn scan_indexes_and_hashes_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in
            [("a0", "a"), ("a1", "a"), ("wow/a0", "a"), ("wowa/a1", "a"), ("wowa/b2", "b2")]
        {
            write_file(dir.path(), rel, content);
        }

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();

        let files = share.files().unwrap();
        assert_eq!(files.len(), 5);
        assert_eq!(
            files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            ["a0", "a1", "wow/a0", "wowa/a1", "wowa/b2"]
        );

        for file in &files {
            assert!(!file.to_checksum);
            assert!(!file.deleted);
            assert!(!file.scan_found, "scan_found resets after the scan");
            assert!(file.updated);
            assert_eq!(file.last_changed_by, share.peer_id());
            assert!(file.last_changed_rev < share.revision());
        }

        assert_eq!(files[0].checksum, sha256_hex("a"));
        assert_eq!(files[4].checksum, sha256_hex("b2"));
        assert_eq!(files[4].size, 2);

        let same_content = share.get_by_checksum(&sha256_hex("a")).unwrap();
        assert_eq!(same_content.len(), 4);
    }

    #[test]
    fn rescan_of_unchanged_tree_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f", "content");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();
        let before = share.files().unwrap();
        let revision = share.revision();

        share.scan_all().unwrap();
        let after = share.files().unwrap();

        assert_eq!(before, after);
        assert_eq!(share.revision(), revision);
    }

    #[test]
    fn content_change_requeues_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f", "one");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();
        let first = share.get_by_path("f").unwrap().unwrap();

        write_file(dir.path(), "f", "longer content");
        share.scan_all().unwrap();
        let second = share.get_by_path("f").unwrap().unwrap();

        assert_ne!(first.checksum, second.checksum);
        assert_eq!(second.checksum, sha256_hex("longer content"));
        assert!(second.last_changed_rev > first.last_changed_rev);
        assert!(second.vclock.is_descendant(&first.vclock));
        assert_ne!(second.vclock, first.vclock);
    }

    #[test]
    fn deleted_file_becomes_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "keep", "k");
        write_file(dir.path(), "gone", "g");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();
        let before = share.get_by_path("gone").unwrap().unwrap();

        fs::remove_file(dir.path().join("gone")).unwrap();
        share.scan_all().unwrap();

        let tomb = share.get_by_path("gone").unwrap().unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.size, 0);
        assert_eq!(tomb.mode, 0);
        assert_eq!(tomb.checksum, "");
        assert!(!tomb.to_checksum);
        assert!(tomb.updated);
        assert!(tomb.last_changed_rev > before.last_changed_rev);

        let keep = share.get_by_path("keep").unwrap().unwrap();
        assert!(!keep.deleted);
    }

    #[test]
    fn tombstones_are_not_rebumped_by_later_scans() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "gone", "g");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();
        fs::remove_file(dir.path().join("gone")).unwrap();
        share.scan_all().unwrap();
        let first = share.get_by_path("gone").unwrap().unwrap();

        share.scan_all().unwrap();
        let second = share.get_by_path("gone").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn file_vanishing_mid_checksum_is_tombstoned() {
        let dir = tempfile::tempdir().unwrap();
        // Larger than one checksum tick (8 × 64 KiB) so hashing spans
        // several steps and we can yank the file from under it.
        let content = "x".repeat(CKSUM_BATCH_SIZE * CKSUM_BLOCK_SIZE + 4096);
        write_file(dir.path(), "flash", &content);

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan();
        assert!(share.scan_step().unwrap(), "hashing must still be in flight");

        fs::remove_file(dir.path().join("flash")).unwrap();
        while share.scan_step().unwrap() {}

        let tomb = share.get_by_path("flash").unwrap().unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.checksum, "");
        assert_eq!(tomb.size, 0);
        assert!(tomb.last_changed_rev < share.revision());
    }

    #[test]
    fn mode_only_change_skips_rehash() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            write_file(dir.path(), "f", "same");
            fs::set_permissions(dir.path().join("f"), fs::Permissions::from_mode(0o644))
                .unwrap();

            let mut share = Share::open(dir.path(), None).unwrap();
            share.scan_all().unwrap();
            let before = share.get_by_path("f").unwrap().unwrap();
            assert_eq!(before.mode, 0o644);

            fs::set_permissions(
                dir.path().join("f"),
                fs::Permissions::from_mode(0o600),
            )
            .unwrap();
            // A chmod bumps ctime but not mtime; only the mode differs.
            share.scan_all().unwrap();

            let after = share.get_by_path("f").unwrap().unwrap();
            assert_eq!(after.mode, 0o600);
            assert_eq!(after.checksum, before.checksum);
            assert!(after.last_changed_rev > before.last_changed_rev);
        }
    }

    #[test]
    fn revision_is_monotone_across_mutations() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a", "1");
        write_file(dir.path(), "b", "2");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();
        write_file(dir.path(), "c", "3");
        fs::remove_file(dir.path().join("a")).unwrap();
        share.scan_all().unwrap();

        let max_rev =
            share.files().unwrap().iter().map(|f| f.last_changed_rev).max().unwrap();
        assert!(max_rev < share.revision());
    }

    #[test]
    fn revision_persists_across_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let db_path = db_dir.path().join("share.db");
        write_file(dir.path(), "f", "x");

        let mut share = Share::open(dir.path(), Some(&db_path)).unwrap();
        share.scan_all().unwrap();
        let revision = share.revision();
        assert!(revision > 0);
        drop(share);

        let reopened = Share::open(dir.path(), Some(&db_path)).unwrap();
        assert_eq!(reopened.revision(), revision);
    }

    #[test]
    fn scan_step_without_scan_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut share = Share::open(dir.path(), None).unwrap();
        assert!(!share.scan_step().unwrap());
    }

    #[test]
    fn seen_vector_after_scan_points_at_own_peer() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f", "x");

        let mut share = Share::open(dir.path(), None).unwrap();
        share.scan_all().unwrap();

        let seen: BTreeMap<String, u64> = share.seen_vector().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key(share.peer_id()));
    }
}
