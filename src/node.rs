//! A single filesystem entry: attributes, extended attributes,
//! directory children, and (for regular files) the content map (spec
//! §4.4).

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::FileAttr;
use fuser::FileType;
use parking_lot::RwLock;

use crate::datalog::DataLog;
use crate::error::FsError;
use crate::error::FsResult;
use crate::rangelist::RangeList;
use crate::record::ContentEntry;
use crate::record::NodeRecord;
use crate::record::XattrEntry;

/// Id of the filesystem root, always present and never unlinked.
pub const ROOT_NODE_ID: u64 = 1;

/// libc access() mask bits, mirrored here so node logic doesn't need
/// `Request` (kept free-standing like `examples/simple.rs`'s
/// `check_access`, since `Request` has no public constructor and this
/// needs to be unit-testable).
pub const ACCESS_READ: i32 = libc::R_OK;
pub const ACCESS_WRITE: i32 = libc::W_OK;
pub const ACCESS_EXEC: i32 = libc::X_OK;

fn system_time_from_parts(secs: i64, nanos: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn parts_from_system_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), 0),
    }
}

/// Returns true if `access_mask` is satisfied for `file_uid`/`file_gid`
/// /`file_mode` by a requester `uid`/`gid`. Root bypasses all checks.
/// Ported from `examples/simple.rs`'s `check_access`.
pub fn check_access(
    file_uid: u32,
    file_gid: u32,
    file_mode: u16,
    uid: u32,
    gid: u32,
    mut access_mask: i32,
) -> bool {
    if access_mask == libc::F_OK {
        return true;
    }
    let file_mode = i32::from(file_mode);

    if uid == 0 {
        if access_mask & libc::X_OK != 0 {
            return file_mode & 0o111 != 0;
        }
        return true;
    }

    if uid == file_uid {
        access_mask -= access_mask & (file_mode >> 6);
    } else if gid == file_gid {
        access_mask -= access_mask & (file_mode >> 3);
    } else {
        access_mask -= access_mask & file_mode;
    }

    access_mask == 0
}

struct Inner {
    parent_id: u64,
    name: Vec<u8>,
    kind: FileType,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    symlink: Vec<u8>,
    xattr: BTreeMap<Vec<u8>, Vec<u8>>,
    contents: RangeList<i64>,
    size: u64,
    /// Directory entries; empty and unused for non-directories.
    children: BTreeMap<Vec<u8>, u64>,
}

/// One filesystem entry. Attributes, xattrs, content map and child
/// table are guarded together by a single `RwLock`, matching spec
/// §4.4's per-node-lock requirement.
pub struct Node {
    pub node_id: u64,
    inner: RwLock<Inner>,
}

impl Node {
    pub fn new_root(uid: u32, gid: u32, mode: u32, now: SystemTime) -> Self {
        Node {
            node_id: ROOT_NODE_ID,
            inner: RwLock::new(Inner {
                parent_id: ROOT_NODE_ID,
                name: Vec::new(),
                kind: FileType::Directory,
                mode: mode_with_kind_bits(mode, FileType::Directory),
                uid,
                gid,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
                symlink: Vec::new(),
                xattr: BTreeMap::new(),
                contents: RangeList::new(),
                size: 0,
                children: BTreeMap::new(),
            }),
        }
    }

    pub fn new(
        node_id: u64,
        parent_id: u64,
        name: Vec<u8>,
        kind: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        now: SystemTime,
    ) -> Self {
        let nlink = if kind == FileType::Directory { 2 } else { 1 };
        Node {
            node_id,
            inner: RwLock::new(Inner {
                parent_id,
                name,
                kind,
                mode: mode_with_kind_bits(mode, kind),
                uid,
                gid,
                nlink,
                atime: now,
                mtime: now,
                ctime: now,
                symlink: Vec::new(),
                xattr: BTreeMap::new(),
                contents: RangeList::new(),
                size: 0,
                children: BTreeMap::new(),
            }),
        }
    }

    /// Rebuild a live node from its latest replayed snapshot.
    pub fn from_record(record: &NodeRecord) -> Self {
        let kind = kind_from_mode(record.mode);
        let mut contents = RangeList::new();
        if let Some(entries) = &record.contents {
            for entry in entries {
                contents.overlay(entry.start, entry.end, entry.base);
            }
        }
        let mut xattr = BTreeMap::new();
        if let Some(entries) = &record.xattr {
            for entry in entries {
                xattr.insert(entry.name.clone(), entry.value.clone());
            }
        }
        Node {
            node_id: record.node_id,
            inner: RwLock::new(Inner {
                parent_id: record.parent_id,
                name: record.name.clone(),
                kind,
                mode: record.mode,
                uid: record.uid,
                gid: record.gid,
                nlink: record.nlink,
                atime: system_time_from_parts(record.atime.0, record.atime.1),
                mtime: system_time_from_parts(record.mtime.0, record.mtime.1),
                ctime: system_time_from_parts(record.ctime.0, record.ctime.1),
                symlink: record.symlink.clone(),
                xattr,
                contents,
                size: record.size,
                children: BTreeMap::new(),
            }),
        }
    }

    /// Snapshot the current state as a full replace record (always
    /// carries `Some(..)` for `contents`/`xattr`, so replay never needs
    /// to distinguish "unchanged" from "now empty").
    pub fn to_record(&self) -> NodeRecord {
        let inner = self.inner.read();
        NodeRecord {
            node_id: self.node_id,
            parent_id: inner.parent_id,
            name: inner.name.clone(),
            mode: inner.mode,
            uid: inner.uid,
            gid: inner.gid,
            nlink: inner.nlink,
            atime: parts_from_system_time(inner.atime),
            mtime: parts_from_system_time(inner.mtime),
            ctime: parts_from_system_time(inner.ctime),
            size: inner.size,
            symlink: inner.symlink.clone(),
            valid: true,
            contents: Some(
                inner
                    .contents
                    .iter()
                    .map(|e| ContentEntry {
                        start: e.min,
                        end: e.max,
                        base: e.data,
                    })
                    .collect(),
            ),
            xattr: Some(
                inner
                    .xattr
                    .iter()
                    .map(|(name, value)| XattrEntry {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn tombstone(node_id: u64, parent_id: u64) -> NodeRecord {
        NodeRecord {
            node_id,
            parent_id,
            name: Vec::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            atime: (0, 0),
            mtime: (0, 0),
            ctime: (0, 0),
            size: 0,
            symlink: Vec::new(),
            valid: false,
            contents: None,
            xattr: None,
        }
    }

    pub fn attr(&self) -> FileAttr {
        let inner = self.inner.read();
        FileAttr {
            ino: self.node_id,
            size: inner.size,
            blocks: inner.size.div_ceil(512),
            atime: inner.atime,
            mtime: inner.mtime,
            ctime: inner.ctime,
            crtime: inner.ctime,
            kind: inner.kind,
            perm: (inner.mode & 0o7777) as u16,
            nlink: inner.nlink,
            uid: inner.uid,
            gid: inner.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    pub fn kind(&self) -> FileType {
        self.inner.read().kind
    }

    pub fn parent_id(&self) -> u64 {
        self.inner.read().parent_id
    }

    pub fn name_snapshot(&self) -> Vec<u8> {
        self.inner.read().name.clone()
    }

    pub fn set_parent(&self, parent_id: u64, name: Vec<u8>) {
        let mut inner = self.inner.write();
        inner.parent_id = parent_id;
        inner.name = name;
    }

    pub fn uid_gid(&self) -> (u32, u32) {
        let inner = self.inner.read();
        (inner.uid, inner.gid)
    }

    pub fn mode(&self) -> u32 {
        self.inner.read().mode
    }

    pub fn check_access(&self, uid: u32, gid: u32, access_mask: i32) -> bool {
        let inner = self.inner.read();
        check_access(inner.uid, inner.gid, inner.mode as u16, uid, gid, access_mask)
    }

    pub fn chmod(&self, mode: u32, now: SystemTime) {
        let mut inner = self.inner.write();
        inner.mode = (inner.mode & !0o7777) | (mode & 0o7777);
        inner.ctime = now;
    }

    pub fn chown(&self, uid: Option<u32>, gid: Option<u32>, now: SystemTime) {
        let mut inner = self.inner.write();
        if let Some(uid) = uid {
            inner.uid = uid;
        }
        if let Some(gid) = gid {
            inner.gid = gid;
        }
        inner.ctime = now;
    }

    /// `utimens`: atime/mtime take the given values; ctime is left at
    /// its current value unless the caller passes an explicit
    /// `ctime` (the `SpecificTime` escape hatch — see spec §4.4).
    pub fn set_times(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>, ctime: Option<SystemTime>) {
        let mut inner = self.inner.write();
        if let Some(atime) = atime {
            inner.atime = atime;
        }
        if let Some(mtime) = mtime {
            inner.mtime = mtime;
        }
        if let Some(ctime) = ctime {
            inner.ctime = ctime;
        }
    }

    pub fn touch_atime(&self, now: SystemTime) {
        self.inner.write().atime = now;
    }

    pub fn link_count(&self) -> u32 {
        self.inner.read().nlink
    }

    pub fn set_link_count(&self, nlink: u32, now: SystemTime) {
        let mut inner = self.inner.write();
        inner.nlink = nlink;
        inner.ctime = now;
    }

    pub fn symlink_target(&self) -> Vec<u8> {
        self.inner.read().symlink.clone()
    }

    pub fn set_symlink_target(&self, target: Vec<u8>) {
        self.inner.write().symlink = target;
    }

    // -- directory children --------------------------------------------

    pub fn lookup_child(&self, name: &[u8]) -> Option<u64> {
        self.inner.read().children.get(name).copied()
    }

    pub fn insert_child(&self, name: Vec<u8>, node_id: u64) {
        self.inner.write().children.insert(name, node_id);
    }

    pub fn remove_child(&self, name: &[u8]) -> Option<u64> {
        self.inner.write().children.remove(name)
    }

    pub fn is_empty_dir(&self) -> bool {
        self.inner.read().children.is_empty()
    }

    pub fn list_children(&self) -> Vec<(Vec<u8>, u64)> {
        self.inner
            .read()
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    // -- content ----------------------------------------------------------

    /// Read up to `size` bytes starting at `offset`. Gaps (never
    /// written, or trimmed by a prior overlay) read back as zero
    /// bytes, matching sparse-file semantics.
    pub fn read_content(&self, data_log: &DataLog, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let end = (offset + u64::from(size) - 1).min(inner.size.saturating_sub(1));
        if inner.size == 0 || offset >= inner.size {
            return Ok(Vec::new());
        }
        let len = (end - offset + 1) as usize;
        let mut out = vec![0u8; len];
        for interval in inner.contents.query(offset, end) {
            let lo = interval.min.max(offset);
            let hi = interval.max.min(end);
            let physical = interval.data + lo as i64;
            if physical < 0 {
                return Err(FsError::Corrupt(format!(
                    "node {} has negative physical offset",
                    self.node_id
                )));
            }
            let chunk_len = (hi - lo + 1) as usize;
            let dest_start = (lo - offset) as usize;
            data_log.read_at(physical as u64, &mut out[dest_start..dest_start + chunk_len])?;
        }
        Ok(out)
    }

    /// Append `data` to the data log and overlay it into the content
    /// map at logical `offset`. Updates `size` and `mtime`/`ctime`.
    pub fn write_content(&self, data_log: &DataLog, offset: u64, data: &[u8], now: SystemTime) -> FsResult<u32> {
        if data.is_empty() {
            return Ok(0);
        }
        let physical = data_log.append(data)?;
        let min = offset;
        let max = offset + data.len() as u64 - 1;
        let base = physical as i64 - min as i64;

        let mut inner = self.inner.write();
        inner.contents.overlay(min, max, base);
        inner.size = inner.size.max(max + 1);
        inner.mtime = now;
        inner.ctime = now;
        Ok(data.len() as u32)
    }

    /// Only `size == 0` truncation is supported (spec §4.4 Non-goals).
    pub fn truncate_to_zero(&self, now: SystemTime) {
        let mut inner = self.inner.write();
        inner.contents.clear();
        inner.size = 0;
        inner.mtime = now;
        inner.ctime = now;
    }

    // -- xattr ------------------------------------------------------------

    pub fn xattr_get(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().xattr.get(name).cloned()
    }

    pub fn xattr_set(&self, name: Vec<u8>, value: Vec<u8>, now: SystemTime) {
        let mut inner = self.inner.write();
        inner.xattr.insert(name, value);
        inner.ctime = now;
    }

    pub fn xattr_remove(&self, name: &[u8], now: SystemTime) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.xattr.remove(name).is_some();
        if removed {
            inner.ctime = now;
        }
        removed
    }

    pub fn xattr_list(&self) -> Vec<Vec<u8>> {
        self.inner.read().xattr.keys().cloned().collect()
    }
}

fn kind_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

/// Stamp the `S_IFMT` bits for `kind` onto `mode`'s permission bits.
/// The kernel only sends permission bits through mkdir/create/symlink;
/// the type tag has to be attached here so a replayed `mode` alone is
/// enough to recover `kind` (see `kind_from_mode`).
fn mode_with_kind_bits(mode: u32, kind: FileType) -> u32 {
    let type_bits = match kind {
        FileType::Directory => libc::S_IFDIR,
        FileType::Symlink => libc::S_IFLNK,
        _ => libc::S_IFREG,
    };
    (mode & 0o7777) | type_bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn root_check_access_bypasses_mode() {
        assert!(check_access(1000, 1000, 0o000, 0, 0, ACCESS_READ | ACCESS_WRITE));
    }

    #[test]
    fn owner_write_denied_without_owner_write_bit() {
        assert!(!check_access(1000, 1000, 0o444, 1000, 1000, ACCESS_WRITE));
        assert!(check_access(1000, 1000, 0o644, 1000, 1000, ACCESS_WRITE));
    }

    #[test]
    fn other_denied_when_not_owner_or_group() {
        assert!(!check_access(1000, 1000, 0o750, 2000, 2000, ACCESS_READ));
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let dir = tempdir().unwrap();
        let data_log = DataLog::open(&dir.path().join("data")).unwrap();
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());

        node.write_content(&data_log, 0, b"hello world", now()).unwrap();
        let read = node.read_content(&data_log, 0, 11).unwrap();
        assert_eq!(&read, b"hello world");
    }

    #[test]
    fn overwrite_of_middle_region_is_reflected_on_read() {
        let dir = tempdir().unwrap();
        let data_log = DataLog::open(&dir.path().join("data")).unwrap();
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());

        node.write_content(&data_log, 0, b"aaaaaaaaaa", now()).unwrap();
        node.write_content(&data_log, 3, b"BBB", now()).unwrap();
        let read = node.read_content(&data_log, 0, 10).unwrap();
        assert_eq!(&read, b"aaaBBBaaaa");
    }

    #[test]
    fn gap_past_written_region_within_size_reads_as_zero() {
        let dir = tempdir().unwrap();
        let data_log = DataLog::open(&dir.path().join("data")).unwrap();
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());

        node.write_content(&data_log, 10, b"x", now()).unwrap();
        let read = node.read_content(&data_log, 0, 11).unwrap();
        assert_eq!(read.len(), 11);
        assert_eq!(&read[..10], &[0u8; 10]);
        assert_eq!(read[10], b'x');
    }

    #[test]
    fn truncate_to_zero_clears_content_and_size() {
        let dir = tempdir().unwrap();
        let data_log = DataLog::open(&dir.path().join("data")).unwrap();
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());
        node.write_content(&data_log, 0, b"hello", now()).unwrap();
        node.truncate_to_zero(now());
        assert_eq!(node.attr().size, 0);
        assert_eq!(node.read_content(&data_log, 0, 5).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn record_round_trip_preserves_content_and_xattr() {
        let dir = tempdir().unwrap();
        let data_log = DataLog::open(&dir.path().join("data")).unwrap();
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());
        node.write_content(&data_log, 0, b"hello", now()).unwrap();
        node.xattr_set(b"user.tag".to_vec(), b"v".to_vec(), now());

        let record = node.to_record();
        let restored = Node::from_record(&record);
        assert_eq!(restored.read_content(&data_log, 0, 5).unwrap(), b"hello");
        assert_eq!(restored.xattr_get(b"user.tag"), Some(b"v".to_vec()));
    }

    #[test]
    fn chmod_and_chown_bump_ctime() {
        let node = Node::new(2, ROOT_NODE_ID, b"f".to_vec(), FileType::RegularFile, 0o644, 0, 0, now());
        let later = now() + Duration::from_secs(10);
        node.chmod(0o600, later);
        assert_eq!(node.attr().ctime, later);
        assert_eq!(node.attr().perm, 0o600);
    }
}
