//! The append-only filesystem core and its `fuser::Filesystem` bridge
//! (spec §4.4, §4.5).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use libc::ENOSYS;
use log::warn;
use parking_lot::RwLock;

use crate::datalog::DataLog;
use crate::error::FsError;
use crate::error::FsResult;
use crate::metalog::replay;
use crate::metalog::MetaLog;
use crate::node::Node;
use crate::node::ROOT_NODE_ID;

/// Entry/attribute cache TTL handed back to the kernel. The backing
/// store can change out from under a cached lookup (another client
/// writing through the same log), so keep it short like
/// `examples/simple.rs`'s `TTL` rather than caching indefinitely.
const TTL: Duration = Duration::from_secs(1);

pub struct AppendFs {
    data_log: DataLog,
    meta_log: MetaLog,
    nodes: RwLock<HashMap<u64, Arc<Node>>>,
    next_node_id: AtomicU64,
}

impl AppendFs {
    pub fn open(data_path: &Path, meta_path: &Path) -> FsResult<Self> {
        let data_log = DataLog::open(data_path)?;
        let meta_log = MetaLog::open(meta_path)?;
        let result = replay(meta_path)?;

        let mut nodes = HashMap::new();
        for (node_id, record) in &result.snapshots {
            nodes.insert(*node_id, Arc::new(Node::from_record(record)));
        }

        let next_node_id = result.last_node_id.max(ROOT_NODE_ID) + 1;

        let fs = AppendFs {
            data_log,
            meta_log,
            nodes: RwLock::new(nodes),
            next_node_id: AtomicU64::new(next_node_id),
        };

        if fs.nodes.read().get(&ROOT_NODE_ID).is_none() {
            let now = SystemTime::now();
            let root = Node::new_root(0, 0, 0o755, now);
            fs.meta_log.append(&root.to_record())?;
            fs.nodes.write().insert(ROOT_NODE_ID, Arc::new(root));
        }

        fs.rebuild_children();
        Ok(fs)
    }

    /// Metadata records don't persist the directory child table
    /// directly; it's derived from every node's own `parent_id`/`name`,
    /// the way spec §1 describes the child-lookup structure as
    /// "derived, not independently authoritative".
    fn rebuild_children(&self) {
        let nodes = self.nodes.read();
        let mut edges = Vec::new();
        for node in nodes.values() {
            if node.node_id == ROOT_NODE_ID {
                continue;
            }
            edges.push((node.parent_id(), node.name_snapshot(), node.node_id));
        }
        for (parent_id, name, node_id) in edges {
            if let Some(parent) = nodes.get(&parent_id) {
                parent.insert_child(name, node_id);
            } else {
                warn!("node {node_id} has orphaned parent {parent_id}, dropping from tree");
            }
        }
    }

    /// Id of the always-present filesystem root.
    pub fn root_id(&self) -> u64 {
        ROOT_NODE_ID
    }

    pub fn attr_of(&self, node_id: u64) -> FsResult<FileAttr> {
        Ok(self.node(node_id)?.attr())
    }

    /// Read up to `size` bytes from a regular file. Exposed alongside the
    /// `fuser::Filesystem::read` adapter so core logic can be exercised
    /// directly in tests without a `Request` (which has no public
    /// constructor).
    pub fn read_file(&self, node_id: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let node = self.node(node_id)?;
        if node.kind() != FileType::RegularFile {
            return Err(FsError::Invalid);
        }
        node.read_content(&self.data_log, offset, size)
    }

    pub fn write_file(&self, node_id: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let node = self.node(node_id)?;
        if node.kind() != FileType::RegularFile {
            return Err(FsError::Invalid);
        }
        let written = node.write_content(&self.data_log, offset, data, SystemTime::now())?;
        self.persist(&node)?;
        Ok(written)
    }

    pub fn read_symlink(&self, node_id: u64) -> FsResult<Vec<u8>> {
        let node = self.node(node_id)?;
        if node.kind() != FileType::Symlink {
            return Err(FsError::Invalid);
        }
        Ok(node.symlink_target())
    }

    fn node(&self, node_id: u64) -> FsResult<Arc<Node>> {
        self.nodes
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn alloc_node_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    fn persist(&self, node: &Node) -> FsResult<()> {
        self.meta_log.append(&node.to_record())?;
        Ok(())
    }

    pub fn lookup_name(&self, parent: u64, name: &OsStr) -> FsResult<Arc<Node>> {
        let parent_node = self.node(parent)?;
        let child_id = parent_node
            .lookup_child(name.as_encoded_bytes())
            .ok_or(FsError::NotFound)?;
        self.node(child_id)
    }

    pub fn create_entry(
        &self,
        parent: u64,
        name: &OsStr,
        kind: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Arc<Node>> {
        let parent_node = self.node(parent)?;
        let raw_name = name.as_encoded_bytes().to_vec();
        if parent_node.lookup_child(&raw_name).is_some() {
            return Err(FsError::Exists);
        }
        let node_id = self.alloc_node_id();
        let now = SystemTime::now();
        let node = Arc::new(Node::new(node_id, parent, raw_name.clone(), kind, mode, uid, gid, now));
        self.persist(&node)?;

        parent_node.insert_child(raw_name, node_id);
        parent_node.touch_atime(now);
        if kind == FileType::Directory {
            parent_node.set_link_count(parent_node.link_count() + 1, now);
        }
        self.persist(&parent_node)?;

        self.nodes.write().insert(node_id, node.clone());
        Ok(node)
    }

    pub fn unlink_entry(&self, parent: u64, name: &OsStr, expect_dir: Option<bool>) -> FsResult<()> {
        let parent_node = self.node(parent)?;
        let raw_name = name.as_encoded_bytes();
        let node_id = parent_node.lookup_child(raw_name).ok_or(FsError::NotFound)?;
        let node = self.node(node_id)?;

        if let Some(want_dir) = expect_dir {
            let is_dir = node.kind() == FileType::Directory;
            if is_dir != want_dir {
                return Err(FsError::Invalid);
            }
        }
        if node.kind() == FileType::Directory && !node.is_empty_dir() {
            return Err(FsError::Invalid);
        }

        parent_node.remove_child(raw_name);

        let now = SystemTime::now();
        let remaining = node.link_count().saturating_sub(1);
        if remaining == 0 {
            parent_node.set_link_count(parent_node.link_count().saturating_sub(1), now);
            self.meta_log.append(&Node::tombstone(node_id, parent))?;
            self.nodes.write().remove(&node_id);
        } else {
            node.set_link_count(remaining, now);
            self.persist(&node)?;
        }
        self.persist(&parent_node)?;
        Ok(())
    }

    pub fn rename_entry(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FsResult<()> {
        let parent_node = self.node(parent)?;
        let raw_name = name.as_encoded_bytes();
        let node_id = parent_node.lookup_child(raw_name).ok_or(FsError::NotFound)?;
        let node = self.node(node_id)?;

        let new_parent_node = self.node(new_parent)?;
        let new_raw_name = new_name.as_encoded_bytes().to_vec();
        if let Some(existing) = new_parent_node.lookup_child(&new_raw_name) {
            let existing_node = self.node(existing)?;
            if existing_node.kind() == FileType::Directory && !existing_node.is_empty_dir() {
                return Err(FsError::Invalid);
            }
            new_parent_node.remove_child(&new_raw_name);
            self.meta_log.append(&Node::tombstone(existing, new_parent))?;
            self.nodes.write().remove(&existing);
        }

        let now = SystemTime::now();
        parent_node.remove_child(raw_name);
        parent_node.set_link_count(parent_node.link_count().saturating_sub(1), now);
        self.persist(&parent_node)?;

        node.set_parent(new_parent, new_raw_name.clone());
        self.persist(&node)?;

        new_parent_node.insert_child(new_raw_name, node_id);
        new_parent_node.set_link_count(new_parent_node.link_count() + 1, now);
        self.persist(&new_parent_node)?;
        Ok(())
    }
}

impl Filesystem for AppendFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_name(parent, name) {
            Ok(node) => reply.entry(&TTL, &node.attr(), 0),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.node(ino) {
            Ok(node) => reply.attr(&TTL, &node.attr()),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        let now = SystemTime::now();

        if let Some(size) = size {
            if size != 0 {
                return reply.error(ENOSYS);
            }
            node.truncate_to_zero(now);
        }
        if let Some(mode) = mode {
            if req.uid() != 0 && req.uid() != node.uid_gid().0 {
                return reply.error(libc::EPERM);
            }
            node.chmod(mode, now);
        }
        if uid.is_some() || gid.is_some() {
            if req.uid() != 0 && req.uid() != node.uid_gid().0 {
                return reply.error(libc::EPERM);
            }
            node.chown(uid, gid, now);
        }
        if atime.is_some() || mtime.is_some() || ctime.is_some() {
            let atime = atime.map(|t| resolve_time(t, now));
            let mtime = mtime.map(|t| resolve_time(t, now));
            node.set_times(atime, mtime, ctime);
        }

        match self.persist(&node) {
            Ok(()) => reply.attr(&TTL, &node.attr()),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: fuser::ReplyData) {
        match self.read_symlink(ino) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.create_entry(parent, name, FileType::Directory, mode, req.uid(), req.gid()) {
            Ok(node) => reply.entry(&TTL, &node.attr(), 0),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_entry(parent, name, Some(true)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_entry(parent, name, Some(false)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        match self.create_entry(parent, link_name, FileType::Symlink, 0o777, req.uid(), req.gid()) {
            Ok(node) => {
                node.set_symlink_target(target.as_os_str().as_encoded_bytes().to_vec());
                if let Err(err) = self.persist(&node) {
                    return reply.error(err.into_errno());
                }
                reply.entry(&TTL, &node.attr(), 0);
            }
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = (|| -> FsResult<FileAttr> {
            let node = self.node(ino)?;
            if node.kind() == FileType::Directory {
                return Err(FsError::Invalid);
            }
            let parent_node = self.node(new_parent)?;
            let raw_name = new_name.as_encoded_bytes().to_vec();
            if parent_node.lookup_child(&raw_name).is_some() {
                return Err(FsError::Exists);
            }
            let now = SystemTime::now();
            node.set_link_count(node.link_count() + 1, now);
            self.persist(&node)?;
            parent_node.insert_child(raw_name, ino);
            self.persist(&parent_node)?;
            Ok(node.attr())
        })();

        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.rename_entry(parent, name, new_parent, new_name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.node(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_entry(parent, name, FileType::RegularFile, mode, req.uid(), req.gid()) {
            Ok(node) => reply.created(&TTL, &node.attr(), 0, 0, 0),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = (|| -> FsResult<Vec<u8>> {
            let node = self.node(ino)?;
            if node.kind() != FileType::RegularFile {
                return Err(FsError::Invalid);
            }
            if offset < 0 {
                return Err(FsError::Invalid);
            }
            node.touch_atime(SystemTime::now());
            node.read_content(&self.data_log, offset as u64, size)
        })();

        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = (|| -> FsResult<u32> {
            let node = self.node(ino)?;
            if node.kind() != FileType::RegularFile {
                return Err(FsError::Invalid);
            }
            if offset < 0 {
                return Err(FsError::Invalid);
            }
            let written = node.write_content(&self.data_log, offset as u64, data, SystemTime::now())?;
            self.persist(&node)?;
            Ok(written)
        })();

        match result {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok()
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.meta_log.sync() {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(FsError::from(err).into_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.node(ino) {
            Ok(node) if node.kind() == FileType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(FsError::Invalid.into_errno()),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        if node.kind() != FileType::Directory {
            return reply.error(FsError::Invalid.into_errno());
        }

        let mut entries: Vec<(u64, FileType, Vec<u8>)> = vec![
            (ino, FileType::Directory, b".".to_vec()),
            (node.parent_id(), FileType::Directory, b"..".to_vec()),
        ];
        for (name, child_id) in node.list_children() {
            let kind = match self.node(child_id) {
                Ok(child) => child.kind(),
                Err(_) => continue,
            };
            entries.push((child_id, kind, name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            let name = OsStr::new(std::str::from_utf8(&name).unwrap_or(""));
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok()
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.node(ino) {
            Ok(node) if node.check_access(req.uid(), req.gid(), mask) => reply.ok(),
            Ok(_) => reply.error(libc::EACCES),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        match node.xattr_get(name.as_encoded_bytes()) {
            None => reply.error(libc::ENODATA),
            Some(value) if size == 0 => reply.size(value.len() as u32),
            Some(value) if (size as usize) < value.len() => reply.error(libc::ERANGE),
            Some(value) => reply.data(&value),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        node.xattr_set(name.as_encoded_bytes().to_vec(), value.to_vec(), SystemTime::now());
        match self.persist(&node) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        let mut buf = Vec::new();
        for name in node.xattr_list() {
            buf.extend_from_slice(&name);
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32)
        } else if (size as usize) < buf.len() {
            reply.error(libc::ERANGE)
        } else {
            reply.data(&buf)
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(err) => return reply.error(err.into_errno()),
        };
        if !node.xattr_remove(name.as_encoded_bytes(), SystemTime::now()) {
            return reply.error(libc::ENODATA);
        }
        match self.persist(&node) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into_errno()),
        }
    }
}

fn resolve_time(time: fuser::TimeOrNow, now: SystemTime) -> SystemTime {
    match time {
        fuser::TimeOrNow::SpecificTime(t) => t,
        fuser::TimeOrNow::Now => now,
    }
}

impl FsError {
    fn into_errno(self) -> i32 {
        libc::c_int::from(self)
    }
}
