//! Read-consistent manifest snapshots for `GetUpdates` replies.
//!
//! The filtered rows are materialized into a single-use SQLite temporary
//! table before being read back, so an interleaved scan or checksum pass
//! cannot perturb the reply mid-iteration. The snapshot is iterated once to
//! build the `Update` message and then discarded.

use std::collections::BTreeMap;

use driftsync_proto::FileRecord;
use rusqlite::{params_from_iter, types::Value};

use super::{MFILE_COLUMNS, MFile, Share};
use crate::errors::ShareError;

/// A frozen, filtered view of the manifest.
#[derive(Debug)]
pub struct FrozenManifest {
    files: Vec<MFile>,
}

impl FrozenManifest {
    /// Rows in path order.
    pub fn iter(&self) -> std::slice::Iter<'_, MFile> {
        self.files.iter()
    }

    /// Number of rows in the snapshot.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the filter matched nothing.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Consume the snapshot into wire records for an `Update`.
    pub fn into_records(self) -> Vec<FileRecord> {
        self.files.iter().map(MFile::to_record).collect()
    }
}

impl<'a> IntoIterator for &'a FrozenManifest {
    type Item = &'a MFile;
    type IntoIter = std::slice::Iter<'a, MFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Share {
    /// Build the manifest delta for a requester that has seen `since`.
    ///
    /// A row is included when its hash is current (`to_checksum = 0`,
    /// non-empty checksum), it is not a tombstone, and it is newer than the
    /// requester's view: either its author is missing from `since`, or its
    /// revision is past the author's entry.
    pub fn get_updates(
        &mut self,
        requester: &str,
        since: &BTreeMap<String, u64>,
    ) -> Result<FrozenManifest, ShareError> {
        self.frozen_seq += 1;
        let table = format!("frozen_files_{}", self.frozen_seq);

        let mut clause = String::new();
        let mut params: Vec<Value> = Vec::new();
        if !since.is_empty() {
            clause.push_str(" AND (");
            for (i, (peer, rev)) in since.iter().enumerate() {
                if i > 0 {
                    clause.push_str(" OR ");
                }
                clause.push_str("(last_changed_by = ? AND last_changed_rev > ?)");
                params.push(Value::from(peer.clone()));
                params.push(Value::from(*rev as i64));
            }
            clause.push_str(" OR last_changed_by NOT IN (");
            for (i, peer) in since.keys().enumerate() {
                if i > 0 {
                    clause.push(',');
                }
                clause.push('?');
                params.push(Value::from(peer.clone()));
            }
            clause.push_str("))");
        }

        let create = format!(
            "CREATE TEMPORARY TABLE {table} AS SELECT {MFILE_COLUMNS} FROM files \
             WHERE deleted = 0 AND to_checksum = 0 AND checksum != ''{clause}"
        );
        self.db.execute(&create, params_from_iter(params))?;

        let files = {
            let select = format!("SELECT {MFILE_COLUMNS} FROM {table} ORDER BY path");
            let mut stmt = self.db.prepare(&select)?;
            let rows = stmt.query_map([], MFile::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        self.db.execute_batch(&format!("DROP TABLE {table}"))?;

        tracing::debug!(
            share_id = %self.share_id,
            requester,
            rows = files.len(),
            "froze manifest for update reply"
        );

        Ok(FrozenManifest { files })
    }
}
