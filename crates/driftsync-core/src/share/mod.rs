//! The share index: one synchronized directory tree and its manifest.
//!
//! A [`Share`] owns a SQLite database with one row of identity (ids, keys,
//! revision counter) and one row per file path. All mutations to manifest
//! rows go through the share so the revision counter and vector clocks stay
//! consistent.
//!
//! The scan/checksum pipeline lives in `scan`, the frozen snapshot used for
//! manifest replies in `frozen`, and remote-update integration in `remote`.

mod frozen;
mod remote;
mod scan;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use driftsync_proto::FileRecord;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params, types::Type};

pub use frozen::FrozenManifest;
pub use remote::{FetchPlan, RemoteOutcome};
pub(crate) use scan::CksumJob;

use crate::{errors::ShareError, vclock::VClock};

/// One manifest entry, mirroring a `files` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MFile {
    /// Relative path within the share, forward slashes, primary key
    pub path: String,
    /// ISO-8601 mtime with trailing `Z`
    pub mtime: String,
    /// Content size in bytes
    pub size: u64,
    /// POSIX permission bits (low 12)
    pub mode: u32,
    /// Set by the scanner when the path was seen on disk this pass
    pub scan_found: bool,
    /// Tombstone flag
    pub deleted: bool,
    /// Content hash is stale and must be recomputed
    pub to_checksum: bool,
    /// Lowercase hex SHA-256 of the content; empty when unknown or deleted
    pub checksum: String,
    /// Share revision at which this entry was last mutated
    pub last_changed_rev: u64,
    /// Peer that last mutated this entry
    pub last_changed_by: String,
    /// Per-peer causality counters
    pub vclock: VClock,
    /// Local change not yet advertised to peers
    pub updated: bool,
}

/// Column list matching [`MFile::from_row`]; every manifest SELECT uses it.
pub(crate) const MFILE_COLUMNS: &str = "path, mtime, size, mode, scan_found, deleted, \
     to_checksum, checksum, last_changed_rev, last_changed_by, vclock, updated";

impl MFile {
    /// Build an entry from a row selected with [`MFILE_COLUMNS`].
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let vclock_json: String = row.get(10)?;
        let vclock = VClock::from_json(&vclock_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e))
        })?;

        Ok(Self {
            path: row.get(0)?,
            mtime: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            mode: row.get::<_, i64>(3)? as u32,
            scan_found: row.get(4)?,
            deleted: row.get(5)?,
            to_checksum: row.get(6)?,
            checksum: row.get(7)?,
            last_changed_rev: row.get::<_, i64>(8)? as u64,
            last_changed_by: row.get(9)?,
            vclock,
            updated: row.get(11)?,
        })
    }

    /// Turn this entry into a tombstone attributed to `peer_id` at `rev`.
    pub(crate) fn tombstone(&mut self, peer_id: &str, rev: u64) {
        self.size = 0;
        self.mode = 0;
        self.scan_found = true;
        self.deleted = true;
        self.to_checksum = false;
        self.checksum.clear();
        self.last_changed_rev = rev;
        self.last_changed_by = peer_id.to_string();
        self.vclock.increment(peer_id);
        self.updated = true;
    }

    /// Wire form of this entry for an `Update` message.
    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            checksum: self.checksum.clone(),
            paths: vec![self.path.clone()],
            last_changed_by: self.last_changed_by.clone(),
            last_changed_rev: self.last_changed_rev,
            mtime: self.mtime.clone(),
            size: self.size,
            mode: self.mode,
            deleted: self.deleted,
            vclock: self.vclock.values().clone(),
        }
    }
}

/// Pre-shared keys of a share, hex-encoded.
///
/// Generated with the identity and persisted; their use to seal the
/// transport is a separate layer and not wired up here.
#[derive(Debug, Clone)]
pub struct ShareKeys {
    /// Read-write key
    pub psk_rw: String,
    /// Read-only key
    pub psk_ro: String,
    /// Untrusted (relay) key
    pub psk_untrusted: String,
}

/// A synchronized directory tree with its indexed manifest.
pub struct Share {
    root: PathBuf,
    db: Connection,
    share_id: String,
    peer_id: String,
    keys: ShareKeys,
    revision: u64,
    quarantine: PathBuf,

    // Scan state
    scan_in_progress: bool,
    walker: Option<walkdir::IntoIter>,
    scan_found_count: u64,
    scan_started: Option<std::time::Instant>,
    last_scan_duration: Option<Duration>,

    // Checksum state: at most one open stream at a time
    cksum_job: Option<CksumJob>,

    // Monotonic suffix for frozen snapshot table names
    frozen_seq: u64,
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("share_id", &self.share_id)
            .field("root", &self.root)
            .field("revision", &self.revision)
            .field("scan_in_progress", &self.scan_in_progress)
            .finish_non_exhaustive()
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// POSIX permission bits (low 12) of a file, zero where the platform has
/// no such notion.
#[cfg(unix)]
pub(crate) fn mode_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_bits(_metadata: &fs::Metadata) -> u32 {
    0
}

impl Share {
    /// Open or create a share for the directory at `root`.
    ///
    /// With `db_path` the manifest is durable and identity survives
    /// re-attach; without it the share lives in memory and gets a fresh
    /// identity every time.
    pub fn open(root: impl Into<PathBuf>, db_path: Option<&Path>) -> Result<Self, ShareError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ShareError::NotADirectory(root.display().to_string()));
        }

        let db = match db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };

        // Manifest writes are recoverable by rescanning; trade durability
        // for not stalling the event loop on fsync.
        db.execute_batch(
            "PRAGMA synchronous = 0;
             PRAGMA page_size = 1024;
             PRAGMA cache_size = -16384;

             CREATE TABLE IF NOT EXISTS share (
                 share_id TEXT PRIMARY KEY,
                 revision INTEGER DEFAULT 0,
                 peer_id TEXT NOT NULL,
                 psk_rw TEXT NOT NULL,
                 psk_ro TEXT NOT NULL,
                 psk_untrusted TEXT NOT NULL,
                 pkc_rw TEXT,
                 pkc_ro TEXT
             );

             CREATE TABLE IF NOT EXISTS files (
                 path TEXT PRIMARY KEY,
                 mtime TEXT,
                 size INTEGER,
                 mode INTEGER,
                 scan_found INTEGER DEFAULT 0,
                 deleted INTEGER DEFAULT 0,
                 to_checksum INTEGER DEFAULT 0,
                 checksum TEXT DEFAULT '',
                 last_changed_rev INTEGER DEFAULT 0,
                 last_changed_by TEXT DEFAULT '',
                 vclock TEXT DEFAULT '',
                 updated INTEGER DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS i_files_checksum ON files(checksum);",
        )?;

        let identity = db
            .query_row(
                "SELECT share_id, revision, peer_id, psk_rw, psk_ro, psk_untrusted FROM share",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let (share_id, revision, peer_id, psk_rw, psk_ro, psk_untrusted) = match identity {
            Some(identity) => identity,
            None => {
                let share_id = random_hex(32);
                let peer_id = random_hex(16);
                let psk_rw = random_hex(16);
                let psk_ro = random_hex(16);
                let psk_untrusted = random_hex(16);
                db.execute(
                    "INSERT INTO share (share_id, revision, peer_id, psk_rw, psk_ro, \
                     psk_untrusted, pkc_rw, pkc_ro) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', '')",
                    params![share_id, 0i64, peer_id, psk_rw, psk_ro, psk_untrusted],
                )?;
                (share_id, 0, peer_id, psk_rw, psk_ro, psk_untrusted)
            },
        };

        let quarantine = match db_path {
            Some(path) => path.with_extension("incoming"),
            None => std::env::temp_dir().join(format!("driftsync-incoming-{share_id}")),
        };
        fs::create_dir_all(&quarantine)?;

        tracing::debug!(%share_id, root = %root.display(), revision, "share attached");

        Ok(Self {
            root,
            db,
            share_id,
            peer_id,
            keys: ShareKeys { psk_rw, psk_ro, psk_untrusted },
            revision,
            quarantine,
            scan_in_progress: false,
            walker: None,
            scan_found_count: 0,
            scan_started: None,
            last_scan_duration: None,
            cksum_job: None,
            frozen_seq: 0,
        })
    }

    /// The share's public identifier (64 hex chars).
    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    /// Our peer identifier within this share (32 hex chars).
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Pre-shared keys for this share.
    pub fn keys(&self) -> &ShareKeys {
        &self.keys
    }

    /// Current revision counter. Strictly greater than every row's
    /// `last_changed_rev` made by this peer.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Root directory of the share.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Duration of the last completed scan, if any.
    pub fn last_scan_duration(&self) -> Option<Duration> {
        self.last_scan_duration
    }

    /// Consume the current revision for a mutation and advance the counter.
    pub(crate) fn take_revision(&mut self) -> Result<u64, ShareError> {
        let rev = self.revision;
        self.revision += 1;
        self.db.execute(
            "UPDATE share SET revision = ?1 WHERE share_id = ?2",
            params![self.revision as i64, self.share_id],
        )?;
        Ok(rev)
    }

    /// Absolute path for a manifest-relative one.
    pub fn fullpath(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Look up one entry by path.
    pub fn get_by_path(&self, path: &str) -> Result<Option<MFile>, ShareError> {
        let sql = format!("SELECT {MFILE_COLUMNS} FROM files WHERE path = ?1");
        let mut stmt = self.db.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![path], MFile::from_row).optional()?)
    }

    /// Every non-deleted entry with a current hash matching `checksum`, in
    /// path order.
    pub fn get_by_checksum(&self, checksum: &str) -> Result<Vec<MFile>, ShareError> {
        let sql = format!(
            "SELECT {MFILE_COLUMNS} FROM files \
             WHERE checksum = ?1 AND deleted = 0 AND to_checksum = 0 ORDER BY path"
        );
        let mut stmt = self.db.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![checksum], MFile::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every manifest entry, ordered by path.
    pub fn files(&self) -> Result<Vec<MFile>, ShareError> {
        let sql = format!("SELECT {MFILE_COLUMNS} FROM files ORDER BY path");
        let mut stmt = self.db.prepare_cached(&sql)?;
        let rows = stmt.query_map([], MFile::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert a new entry.
    pub fn insert_mfile(&self, file: &MFile) -> Result<(), ShareError> {
        let mut stmt = self.db.prepare_cached(
            "INSERT INTO files (path, mtime, size, mode, scan_found, deleted, to_checksum, \
             checksum, last_changed_rev, last_changed_by, vclock, updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        stmt.execute(params![
            file.path,
            file.mtime,
            file.size as i64,
            file.mode as i64,
            file.scan_found,
            file.deleted,
            file.to_checksum,
            file.checksum,
            file.last_changed_rev as i64,
            file.last_changed_by,
            file.vclock.to_json(),
            file.updated,
        ])?;
        Ok(())
    }

    /// Update an existing entry by primary key.
    pub fn update_mfile(&self, file: &MFile) -> Result<(), ShareError> {
        let mut stmt = self.db.prepare_cached(
            "UPDATE files SET mtime = ?1, size = ?2, mode = ?3, scan_found = ?4, deleted = ?5, \
             to_checksum = ?6, checksum = ?7, last_changed_rev = ?8, last_changed_by = ?9, \
             vclock = ?10, updated = ?11 WHERE path = ?12",
        )?;
        stmt.execute(params![
            file.mtime,
            file.size as i64,
            file.mode as i64,
            file.scan_found,
            file.deleted,
            file.to_checksum,
            file.checksum,
            file.last_changed_rev as i64,
            file.last_changed_by,
            file.vclock.to_json(),
            file.updated,
            file.path,
        ])?;
        Ok(())
    }

    /// Insert or overwrite an entry by primary key.
    pub(crate) fn upsert_mfile(&self, file: &MFile) -> Result<(), ShareError> {
        if self.get_by_path(&file.path)?.is_some() {
            self.update_mfile(file)
        } else {
            self.insert_mfile(file)
        }
    }

    /// Latest revision we hold from each peer that authored manifest rows.
    ///
    /// This is the `since` vector sent with `GetUpdates`: everything newer
    /// than it is what we are missing.
    pub fn seen_vector(&self) -> Result<BTreeMap<String, u64>, ShareError> {
        let mut stmt = self.db.prepare_cached(
            "SELECT last_changed_by, MAX(last_changed_rev) FROM files \
             WHERE last_changed_by != '' GROUP BY last_changed_by",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }

    /// Create an exclusive sink file in the quarantine directory for content
    /// being fetched.
    pub fn quarantine_sink(&self, checksum: &str) -> Result<(fs::File, PathBuf), ShareError> {
        let path = self.quarantine.join(format!("{checksum}.part"));
        let file = fs::File::create(&path)?;
        Ok((file, path))
    }
}
