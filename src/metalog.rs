//! Append-only log of node snapshots, and the replay that reconstructs
//! the live tree from it (spec §4.3).

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::record::decode_record;
use crate::record::encode_record;
use crate::record::NodeRecord;

/// The metadata log: one append-only writer guarded by a single lock
/// over `(length-prefix, body)` so no other record can land between
/// them (spec §5).
pub struct MetaLog {
    writer: Mutex<File>,
}

impl MetaLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(MetaLog {
            writer: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &NodeRecord) -> io::Result<()> {
        let framed = encode_record(record)?;
        let mut file = self.writer.lock();
        file.write_all(&framed)?;
        file.flush()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.writer.lock().sync_data()
    }
}

/// The result of folding every record in the log: a flat table of the
/// latest known state per node id, and the highest node id seen (used
/// to seed the allocator on mount).
pub struct Replay {
    pub snapshots: HashMap<u64, NodeRecord>,
    pub last_node_id: u64,
}

/// Replay `path` from the start, applying the merge discipline:
/// scalar fields always take the new record's value, `contents` and
/// `xattr` replace wholesale when `Some` in the new record and are
/// left untouched when `None`, and `valid: false` tombstones the node
/// (removed from the snapshot table but its id is still tracked for
/// `last_node_id`).
///
/// A record whose length prefix or body is truncated ends replay at
/// that point without error (spec §4.3: "a trailing incomplete record
/// ... is dropped, not treated as an error"). A valid (`valid: true`)
/// record missing a `parent_id` for a non-root node is reported as
/// corrupt, since it can never be attached to the tree.
pub fn replay(path: &Path) -> Result<Replay, crate::error::FsError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Replay {
                snapshots: HashMap::new(),
                last_node_id: 0,
            });
        }
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);

    let mut snapshots: HashMap<u64, NodeRecord> = HashMap::new();
    let mut last_node_id = 0u64;

    loop {
        let record = match decode_record(&mut reader)? {
            Some(record) => record,
            None => break,
        };
        last_node_id = last_node_id.max(record.node_id);

        if record.valid && record.node_id != crate::node::ROOT_NODE_ID && record.parent_id == 0 {
            return Err(crate::error::FsError::Corrupt(format!(
                "node {} has no parent_id",
                record.node_id
            )));
        }

        if !record.valid {
            snapshots.remove(&record.node_id);
            continue;
        }

        match snapshots.get_mut(&record.node_id) {
            Some(existing) => merge(existing, record),
            None => {
                snapshots.insert(record.node_id, record);
            }
        }
    }

    Ok(Replay {
        snapshots,
        last_node_id,
    })
}

fn merge(existing: &mut NodeRecord, new: NodeRecord) {
    let NodeRecord {
        node_id,
        parent_id,
        name,
        mode,
        uid,
        gid,
        nlink,
        atime,
        mtime,
        ctime,
        size,
        symlink,
        valid,
        contents,
        xattr,
    } = new;

    existing.node_id = node_id;
    existing.parent_id = parent_id;
    existing.name = name;
    existing.mode = mode;
    existing.uid = uid;
    existing.gid = gid;
    existing.nlink = nlink;
    existing.atime = atime;
    existing.mtime = mtime;
    existing.ctime = ctime;
    existing.size = size;
    existing.symlink = symlink;
    existing.valid = valid;
    if contents.is_some() {
        existing.contents = contents;
    }
    if xattr.is_some() {
        existing.xattr = xattr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContentEntry;
    use tempfile::tempdir;

    fn record(node_id: u64, parent_id: u64, valid: bool) -> NodeRecord {
        NodeRecord {
            node_id,
            parent_id,
            name: b"n".to_vec(),
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlink: 1,
            atime: (0, 0),
            mtime: (0, 0),
            ctime: (0, 0),
            size: 0,
            symlink: Vec::new(),
            valid,
            contents: None,
            xattr: None,
        }
    }

    #[test]
    fn missing_log_replays_empty() {
        let dir = tempdir().unwrap();
        let replay = replay(&dir.path().join("meta")).unwrap();
        assert!(replay.snapshots.is_empty());
        assert_eq!(replay.last_node_id, 0);
    }

    #[test]
    fn later_scalar_fields_overwrite_earlier_ones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        let log = MetaLog::open(&path).unwrap();

        let mut first = record(2, crate::node::ROOT_NODE_ID, true);
        first.mode = 0o600;
        log.append(&first).unwrap();

        let mut second = record(2, crate::node::ROOT_NODE_ID, true);
        second.mode = 0o755;
        log.append(&second).unwrap();

        let replay = replay(&path).unwrap();
        assert_eq!(replay.snapshots[&2].mode, 0o755);
        assert_eq!(replay.last_node_id, 2);
    }

    #[test]
    fn contents_replace_wholesale_only_when_present() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        let log = MetaLog::open(&path).unwrap();

        let mut first = record(2, crate::node::ROOT_NODE_ID, true);
        first.contents = Some(vec![ContentEntry {
            start: 0,
            end: 9,
            base: 0,
        }]);
        log.append(&first).unwrap();

        let mut second = record(2, crate::node::ROOT_NODE_ID, true);
        second.mode = 0o600;
        second.contents = None;
        log.append(&second).unwrap();

        let replay = replay(&path).unwrap();
        assert_eq!(replay.snapshots[&2].mode, 0o600);
        assert!(replay.snapshots[&2].contents.is_some());
    }

    #[test]
    fn invalid_tombstones_remove_the_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        let log = MetaLog::open(&path).unwrap();

        log.append(&record(2, crate::node::ROOT_NODE_ID, true)).unwrap();
        log.append(&record(2, crate::node::ROOT_NODE_ID, false)).unwrap();

        let replay = replay(&path).unwrap();
        assert!(!replay.snapshots.contains_key(&2));
        assert_eq!(replay.last_node_id, 2);
    }

    #[test]
    fn truncated_trailing_record_is_dropped_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        {
            let log = MetaLog::open(&path).unwrap();
            log.append(&record(2, crate::node::ROOT_NODE_ID, true)).unwrap();
        }
        {
            let file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_at(&[0x05, 0xff, 0xff], file.metadata().unwrap().len())
                .unwrap();
        }
        let replay = replay(&path).unwrap();
        assert_eq!(replay.snapshots.len(), 1);
        assert!(replay.snapshots.contains_key(&2));
    }

    #[test]
    fn non_root_node_missing_parent_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        let log = MetaLog::open(&path).unwrap();
        log.append(&record(2, 0, true)).unwrap();
        assert!(replay(&path).is_err());
    }
}
