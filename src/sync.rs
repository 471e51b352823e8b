//! The reconciliation engine.
//!
//! [`Syncer`] diffs a destination [`Filesystem`] against a streaming tar
//! archive and repairs the destination entry by entry: contents, mode bits,
//! ownership, timestamps, symlink targets and hardlink identity.  It is an
//! iterator over [`PathUpdate`] records, one per observed change; entries
//! already in the desired state are silent.
//!
//! The engine assumes exclusive ownership of the destination for the
//! duration of a run.  It works in tar order, then deletes whatever the
//! archive did not mention, in lexicographic order.

use std::{
    collections::HashSet,
    ffi::OsString,
    io::{self, Read},
    mem,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    update::{PathUpdate, Summary},
    vfs::{FileKind, Filesystem, Metadata, S_IFDIR, S_IFLNK, S_IFREG},
};

/// Which entry classes the engine reconciles.  Everything defaults to on.
///
/// Disabling a class makes the engine skip the matching tar entries without
/// touching the destination; see [`Syncer`] for the exact skip semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub symlinks: bool,
    pub hard_links: bool,
    pub ownership: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            symlinks: true,
            hard_links: true,
            ownership: true,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn symlinks(mut self, v: bool) -> Self {
        self.symlinks = v;
        self
    }

    pub fn hard_links(mut self, v: bool) -> Self {
        self.hard_links = v;
        self
    }

    pub fn ownership(mut self, v: bool) -> Self {
        self.ownership = v;
        self
    }
}

/// Terminal errors of a sync run.  The first failure ends the run; there is
/// no cleanup or rollback.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("symlink syncing is enabled but the filesystem does not support symlinks")]
    SymlinksUnsupported,
    #[error("hard link syncing is enabled but the filesystem does not support hard links")]
    HardLinksUnsupported,
    #[error("ownership syncing is enabled but the filesystem does not report ownership")]
    OwnershipUnsupported,
    #[error("failed to walk filesystem: {0}")]
    Walk(#[source] io::Error),
    #[error("failed to read tar entry: {0}")]
    Tar(#[source] io::Error),
    #[error("unexpected entry type in tar: {}: {type_byte}", .path.display())]
    UnexpectedEntry { path: PathBuf, type_byte: u8 },
    #[error("failed to {op}: {}: {source}", .path.display())]
    Op {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn fsop(op: &'static str, path: &Path, source: io::Error) -> SyncError {
    SyncError::Op {
        op,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
}

impl EntryKind {
    fn type_bits(self) -> u32 {
        match self {
            // A hardlink entry adopts its target's inode, which is regular.
            EntryKind::Regular | EntryKind::Hardlink => S_IFREG,
            EntryKind::Directory => S_IFDIR,
            EntryKind::Symlink => S_IFLNK,
        }
    }
}

/// The header fields the engine needs from one tar entry.
struct EntryMeta {
    path: PathBuf,
    kind: EntryKind,
    size: u64,
    /// Full `st_mode` the archive dictates: type bits plus the header's
    /// permission and setuid/setgid/sticky bits.
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    /// Symlink target (verbatim) or hardlink target (a path); empty for
    /// other kinds.
    link: OsString,
}

impl EntryMeta {
    fn parse<R: Read>(entry: &tar::Entry<'_, R>) -> Result<EntryMeta, SyncError> {
        let path = normalize_path(&entry.path().map_err(SyncError::Tar)?);

        let header = entry.header();
        let type_byte = header.entry_type().as_byte();
        let kind = match header.entry_type() {
            tar::EntryType::Regular => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Hardlink,
            _ => return Err(SyncError::UnexpectedEntry { path, type_byte }),
        };

        let link = match kind {
            EntryKind::Symlink | EntryKind::Hardlink => {
                let target = entry
                    .link_name()
                    .map_err(SyncError::Tar)?
                    .ok_or_else(|| {
                        SyncError::Tar(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "link entry without a link name",
                        ))
                    })?;
                target.into_owned().into_os_string()
            }
            _ => OsString::new(),
        };

        Ok(EntryMeta {
            mode: kind.type_bits() | (header.mode().map_err(SyncError::Tar)? & 0o7777),
            size: header.size().map_err(SyncError::Tar)?,
            uid: header.uid().map_err(SyncError::Tar)? as u32,
            gid: header.gid().map_err(SyncError::Tar)? as u32,
            mtime: header.mtime().map_err(SyncError::Tar)? as i64,
            path,
            kind,
            link,
        })
    }
}

/// Reconciles a destination filesystem against a tar stream.
///
/// Iterate to drive the run: every item is either one non-empty
/// [`PathUpdate`] or the terminal [`SyncError`].  After an error (or clean
/// exhaustion) the iterator yields `None` forever.
///
/// Tar entries whose class is disabled in [`Options`] are skipped: the
/// destination entry, if any, is neither reconciled nor deleted.
///
/// Hardlink targets must precede their links in tar order; the engine does
/// not reorder, and a violating archive fails when the target is stat'ed.
pub struct Syncer<'a, F: Filesystem, R: Read> {
    fs: &'a F,
    entries: tar::Entries<'a, R>,
    opts: Options,

    inventory: Option<HashSet<PathBuf>>,
    delete_queue: Option<std::vec::IntoIter<PathBuf>>,

    base_dir: Option<(PathBuf, i64)>,

    pending: PathUpdate,
    summary: Summary,
    done: bool,
}

impl<'a, F: Filesystem, R: Read> Syncer<'a, F, R> {
    /// Creates an engine with default options (everything on).
    pub fn new(fs: &'a F, archive: &'a mut tar::Archive<R>) -> Result<Self, SyncError> {
        Syncer::with_options(fs, archive, Options::default())
    }

    /// Creates an engine, verifying up front that `fs` provides every
    /// capability the enabled options require.  A missing capability is
    /// fatal here; no operation has touched the destination yet.
    pub fn with_options(
        fs: &'a F,
        archive: &'a mut tar::Archive<R>,
        opts: Options,
    ) -> Result<Self, SyncError> {
        let caps = fs.capabilities();
        if opts.symlinks && !caps.symlinks {
            return Err(SyncError::SymlinksUnsupported);
        }
        if opts.hard_links && !caps.hard_links {
            return Err(SyncError::HardLinksUnsupported);
        }
        if opts.ownership && !caps.ownership {
            return Err(SyncError::OwnershipUnsupported);
        }

        Ok(Syncer {
            fs,
            entries: archive.entries().map_err(SyncError::Tar)?,
            opts,
            inventory: None,
            delete_queue: None,
            base_dir: None,
            pending: PathUpdate::default(),
            summary: Summary::default(),
            done: false,
        })
    }

    /// Drains the iterator, returning every update of a successful run.
    pub fn run(&mut self) -> Result<Vec<PathUpdate>, SyncError> {
        let mut updates = Vec::new();
        for upd in self {
            updates.push(upd?);
        }
        Ok(updates)
    }

    /// Counters over every update yielded so far.
    pub fn summary(&self) -> Summary {
        self.summary
    }

    fn step(&mut self) -> Result<Option<PathUpdate>, SyncError> {
        if self.inventory.is_none() {
            let paths = self.fs.all_paths().map_err(SyncError::Walk)?;
            self.inventory = Some(paths.iter().map(|p| normalize_path(p)).collect());
        }

        // Add and update entries, in tar order.
        while let Some(item) = self.entries.next() {
            let mut entry = item.map_err(SyncError::Tar)?;
            let meta = EntryMeta::parse(&entry)?;

            self.pending = PathUpdate::new(meta.path.clone());

            // The path leaves the inventory even when the entry class is
            // disabled below: a skipped entry must not reappear as a
            // deletion.
            if let Some(inventory) = &mut self.inventory {
                inventory.remove(&meta.path);
            }

            match meta.kind {
                EntryKind::Regular => self.sync_regular(&meta, &mut entry)?,
                EntryKind::Directory => self.sync_dir(&meta)?,
                EntryKind::Symlink => {
                    if self.opts.symlinks {
                        self.sync_symlink(&meta)?;
                    }
                }
                EntryKind::Hardlink => {
                    if self.opts.hard_links {
                        self.sync_hardlink(&meta)?;
                    }
                }
            }

            if !self.pending.is_empty() {
                return Ok(Some(mem::take(&mut self.pending)));
            }
        }

        // Whatever the archive did not mention gets deleted.
        if self.delete_queue.is_none() {
            let mut paths: Vec<PathBuf> = self
                .inventory
                .take()
                .unwrap_or_default()
                .into_iter()
                .collect();
            paths.sort();
            self.delete_queue = Some(paths.into_iter());
        }

        while let Some(path) = self.delete_queue.as_mut().and_then(Iterator::next) {
            if path == Path::new(".") {
                continue;
            }

            // Some enumerators report pseudo-entries that cannot be stat'ed
            // or removed; tolerate them, along with children of subtrees
            // already deleted earlier in this pass or replaced by non-dirs
            // during the tar phase.
            match self.fs.lstat(&path) {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(fsop("stat", &path, e)),
                Ok(_) => {}
            }

            self.preserve_base_dir(Some(parent_dir(&path)))?;

            debug!(path = %path.display(), "removing entry not present in archive");
            self.fs
                .remove_all(&path)
                .map_err(|e| fsop("remove", &path, e))?;

            return Ok(Some(PathUpdate {
                deleted: true,
                ..PathUpdate::new(path)
            }));
        }

        self.preserve_base_dir(None)?;
        Ok(None)
    }

    fn sync_regular<R2: Read>(
        &mut self,
        meta: &EntryMeta,
        body: &mut tar::Entry<'_, R2>,
    ) -> Result<(), SyncError> {
        let path = &meta.path;
        let mut fi = self.lstat_opt(path)?;

        if let Some(m) = &fi {
            if m.kind != FileKind::Regular {
                debug!(path = %path.display(), "replacing entry of a different type");
                self.preserve_base_dir(Some(parent_dir(path)))?;
                self.fs
                    .remove_all(path)
                    .map_err(|e| fsop("remove", path, e))?;
                fi = None;
            }
        }

        // Contents are considered up to date when size and mtime both match;
        // the engine never hashes.
        let current = matches!(&fi, Some(m) if m.size == meta.size && m.mtime == meta.mtime);
        if !current {
            self.preserve_base_dir(Some(parent_dir(path)))?;
            self.fs
                .write_file(path, body)
                .map_err(|e| fsop("write file", path, e))?;
            self.pending.added = true;
            fi = None;
        }

        self.sync_meta(meta, fi)
    }

    fn sync_dir(&mut self, meta: &EntryMeta) -> Result<(), SyncError> {
        let path = &meta.path;
        let mut fi = self.lstat_opt(path)?;

        if let Some(m) = &fi {
            if m.kind != FileKind::Directory {
                debug!(path = %path.display(), "replacing entry of a different type");
                self.preserve_base_dir(Some(parent_dir(path)))?;
                self.fs.remove(path).map_err(|e| fsop("remove", path, e))?;
                fi = None;
            }
        }

        if fi.is_none() {
            self.preserve_base_dir(Some(parent_dir(path)))?;
            self.fs
                .mkdir(path, meta.mode & 0o777)
                .map_err(|e| fsop("make dir", path, e))?;
            self.pending.added = true;
            self.pending.mode = Some(S_IFDIR | (meta.mode & 0o777));
        }

        self.sync_meta(meta, fi)
    }

    fn sync_symlink(&mut self, meta: &EntryMeta) -> Result<(), SyncError> {
        let path = &meta.path;
        let target = meta.link.as_os_str();
        let mut fi = self.lstat_opt(path)?;

        if let Some(m) = &fi {
            if m.kind != FileKind::Symlink {
                debug!(path = %path.display(), "replacing entry of a different type");
                self.preserve_base_dir(Some(parent_dir(path)))?;
                self.fs
                    .remove_all(path)
                    .map_err(|e| fsop("remove", path, e))?;
                fi = None;
            }
        }

        // An existing symlink with the wrong target is recreated.
        if fi.is_some() {
            let current = self
                .fs
                .readlink(path)
                .map_err(|e| fsop("read link", path, e))?;
            if current.as_os_str() != target {
                self.preserve_base_dir(Some(parent_dir(path)))?;
                self.fs
                    .remove(path)
                    .map_err(|e| fsop("remove link", path, e))?;
                fi = None;
            }
        }

        if fi.is_none() {
            self.preserve_base_dir(Some(parent_dir(path)))?;
            self.fs
                .symlink(target, path)
                .map_err(|e| fsop("make link", path, e))?;
            self.pending.added = true;
            self.pending.link = Some(target.to_os_string());
        }

        self.sync_meta(meta, fi)
    }

    fn sync_hardlink(&mut self, meta: &EntryMeta) -> Result<(), SyncError> {
        let path = &meta.path;
        let target = normalize_path(Path::new(&meta.link));
        let mut fi = self.lstat_opt(path)?;

        if let Some(m) = &fi {
            // The target is expected to exist already: the archive must
            // materialize it before linking to it.
            let target_fi = self
                .fs
                .lstat(&target)
                .map_err(|e| fsop("stat link target", &target, e))?;
            if m.ino != target_fi.ino {
                self.preserve_base_dir(Some(parent_dir(path)))?;
                self.fs
                    .remove_all(path)
                    .map_err(|e| fsop("remove link", path, e))?;
                fi = None;
            }
        }

        if fi.is_none() {
            self.preserve_base_dir(Some(parent_dir(path)))?;
            self.fs
                .hardlink(&target, path)
                .map_err(|e| fsop("make link", path, e))?;
            self.pending.added = true;
        }

        self.sync_meta(meta, fi)
    }

    /// Shared post-step for every entry: ownership, mode, mtime.
    ///
    /// chown comes first, and the mode check runs against a fresh lstat,
    /// since chown may clear the setgid bit on group-executable files; the
    /// subsequent chmod puts it back.
    fn sync_meta(&mut self, meta: &EntryMeta, fi: Option<Metadata>) -> Result<(), SyncError> {
        let path = &meta.path;
        let mut fi = match fi {
            Some(m) => m,
            None => self.fs.lstat(path).map_err(|e| fsop("stat", path, e))?,
        };

        if self.opts.ownership && (meta.uid != fi.uid || meta.gid != fi.gid) {
            let res = if meta.kind == EntryKind::Symlink {
                self.fs.lchown(path, meta.uid, meta.gid)
            } else {
                self.fs.chown(path, meta.uid, meta.gid)
            };
            res.map_err(|e| fsop("chown", path, e))?;

            self.pending.uid = Some(meta.uid);
            self.pending.gid = Some(meta.gid);

            fi = self.fs.lstat(path).map_err(|e| fsop("stat", path, e))?;
        }

        // Symlink permission bits are ignored by most systems; leave them be.
        if meta.kind != EntryKind::Symlink && meta.mode != fi.mode {
            self.fs
                .chmod(path, meta.mode)
                .map_err(|e| fsop("chmod", path, e))?;
            self.pending.mode = Some(meta.mode);
        }

        if meta.mtime != fi.mtime {
            self.fs
                .chtimes(path, meta.mtime, meta.mtime)
                .map_err(|e| fsop("chtimes", path, e))?;
            self.pending.mtime = Some(meta.mtime);
        }

        Ok(())
    }

    /// Snapshot `dir`'s mtime before the first mutation under it, restoring
    /// the previously held directory when the parent changes.
    ///
    /// Mutating a child updates the containing directory's mtime, but the
    /// archive dictates each directory's mtime through its own entry; this
    /// undoes the side effect.  Entries under one parent are contiguous in
    /// well-formed archives, so a single slot suffices.  `None` finalizes:
    /// it releases any held snapshot without taking a new one.
    fn preserve_base_dir(&mut self, dir: Option<&Path>) -> Result<(), SyncError> {
        if let (Some(dir), Some((held, _))) = (dir, &self.base_dir) {
            if dir == held.as_path() {
                return Ok(());
            }
        }

        if let Some((held, mtime)) = self.base_dir.take() {
            debug!(path = %held.display(), mtime, "restoring base dir mtime");
            self.fs
                .chtimes(&held, mtime, mtime)
                .map_err(|e| fsop("preserve base dir mtime", &held, e))?;
        }

        if let Some(dir) = dir {
            let fi = self
                .fs
                .lstat(dir)
                .map_err(|e| fsop("stat base dir", dir, e))?;
            self.base_dir = Some((dir.to_path_buf(), fi.mtime));
        }

        Ok(())
    }

    fn lstat_opt(&self, path: &Path) -> Result<Option<Metadata>, SyncError> {
        match self.fs.lstat(path) {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(fsop("stat", path, e)),
        }
    }
}

impl<F: Filesystem, R: Read> Iterator for Syncer<'_, F, R> {
    type Item = Result<PathUpdate, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(upd)) => {
                self.summary.record(&upd);
                Some(Ok(upd))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Cleans a path from the archive or an enumeration into the engine's
/// canonical form: relative, no leading separator or dot segment, `.` and
/// `..` resolved syntactically.  The root is `"."`.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// The containing directory of a normalized path; `"."` for top-level
/// entries and for the root itself.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(normalize_path(Path::new("./test.txt")), Path::new("test.txt"));
        assert_eq!(normalize_path(Path::new("/etc/passwd")), Path::new("etc/passwd"));
        assert_eq!(normalize_path(Path::new("etc/")), Path::new("etc"));
        assert_eq!(normalize_path(Path::new("./etc/./x")), Path::new("etc/x"));
        assert_eq!(normalize_path(Path::new("a/b/../c")), Path::new("a/c"));
        assert_eq!(normalize_path(Path::new("../x")), Path::new("x"));
        assert_eq!(normalize_path(Path::new(".")), Path::new("."));
        assert_eq!(normalize_path(Path::new("./")), Path::new("."));
        assert_eq!(normalize_path(Path::new("/")), Path::new("."));
    }

    #[test]
    fn parent() {
        assert_eq!(parent_dir(Path::new("test.txt")), Path::new("."));
        assert_eq!(parent_dir(Path::new("etc/passwd")), Path::new("etc"));
        assert_eq!(parent_dir(Path::new("a/b/c")), Path::new("a/b"));
        assert_eq!(parent_dir(Path::new(".")), Path::new("."));
    }
}
