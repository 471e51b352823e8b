//! An in-memory destination filesystem.
//!
//! `MemFs` stores a tree of directories and `Rc`-shared leaf inodes, so
//! hardlinked paths genuinely share one inode.  It emulates the POSIX side
//! effects the engine exists to handle: mutating a directory's children
//! bumps the directory's mtime, and chown clears the setuid/setgid bits on
//! non-directories the way Linux does.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    io::{self, Read},
    path::{Component, Path, PathBuf},
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    sync::normalize_path,
    vfs::{
        Capabilities, FileKind, Filesystem, Metadata, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_ISGID,
        S_ISUID,
    },
};

const SYMLINK_HOPS_MAX: usize = 40;

#[derive(Debug, Clone)]
struct Stat {
    /// Full `st_mode`: type bits plus permissions.
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    ino: u64,
}

#[derive(Debug)]
enum LeafContent {
    Regular(Vec<u8>),
    Symlink(OsString),
}

#[derive(Debug)]
struct Leaf {
    stat: Stat,
    content: LeafContent,
}

#[derive(Debug)]
struct Dir {
    stat: Stat,
    entries: BTreeMap<OsString, Node>,
}

#[derive(Debug)]
enum Node {
    Directory(Dir),
    Leaf(Rc<RefCell<Leaf>>),
}

/// An in-memory filesystem with the full capability set.
#[derive(Debug)]
pub struct MemFs {
    root: RefCell<Dir>,
    next_ino: Cell<u64>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn not_found() -> io::Error {
    io::ErrorKind::NotFound.into()
}

fn invalid_path() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "invalid path")
}

fn is_root(path: &Path) -> bool {
    path == Path::new(".") || path.as_os_str().is_empty()
}

/// Splits a path into its containing directory and final name.  The caller
/// handles the root before calling this.
fn split(path: &Path) -> io::Result<(&Path, &OsStr)> {
    let name = path.file_name().ok_or_else(invalid_path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    Ok((parent, name))
}

fn dir_ref<'a>(mut dir: &'a Dir, path: &Path) -> io::Result<&'a Dir> {
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => {
                dir = match dir.entries.get(name) {
                    Some(Node::Directory(d)) => d,
                    Some(_) => return Err(io::ErrorKind::NotADirectory.into()),
                    None => return Err(not_found()),
                };
            }
            _ => return Err(invalid_path()),
        }
    }
    Ok(dir)
}

fn dir_mut<'a>(mut dir: &'a mut Dir, path: &Path) -> io::Result<&'a mut Dir> {
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => {
                dir = match dir.entries.get_mut(name) {
                    Some(Node::Directory(d)) => d,
                    Some(_) => return Err(io::ErrorKind::NotADirectory.into()),
                    None => return Err(not_found()),
                };
            }
            _ => return Err(invalid_path()),
        }
    }
    Ok(dir)
}

fn dir_metadata(dir: &Dir) -> Metadata {
    Metadata {
        kind: FileKind::Directory,
        size: 0,
        mode: dir.stat.mode,
        mtime: dir.stat.mtime,
        uid: dir.stat.uid,
        gid: dir.stat.gid,
        ino: dir.stat.ino,
    }
}

fn leaf_metadata(leaf: &Leaf) -> Metadata {
    let (kind, size) = match &leaf.content {
        LeafContent::Regular(data) => (FileKind::Regular, data.len() as u64),
        LeafContent::Symlink(target) => (FileKind::Symlink, target.len() as u64),
    };
    Metadata {
        kind,
        size,
        mode: leaf.stat.mode,
        mtime: leaf.stat.mtime,
        uid: leaf.stat.uid,
        gid: leaf.stat.gid,
        ino: leaf.stat.ino,
    }
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            root: RefCell::new(Dir {
                stat: Stat {
                    mode: S_IFDIR | 0o755,
                    uid: 0,
                    gid: 0,
                    mtime: now(),
                    ino: 1,
                },
                entries: BTreeMap::new(),
            }),
            next_ino: Cell::new(2),
        }
    }

    fn alloc_ino(&self) -> u64 {
        let ino = self.next_ino.get();
        self.next_ino.set(ino + 1);
        ino
    }

    /// Applies `f` to the stat of the entry at `path`, without following a
    /// final symlink.
    fn update_stat(&self, path: &Path, f: impl FnOnce(&mut Stat)) -> io::Result<()> {
        let mut root = self.root.borrow_mut();
        if is_root(path) {
            f(&mut root.stat);
            return Ok(());
        }
        let (parent, name) = split(path)?;
        let dir = dir_mut(&mut root, parent)?;
        match dir.entries.get_mut(name) {
            Some(Node::Directory(d)) => f(&mut d.stat),
            Some(Node::Leaf(l)) => f(&mut l.borrow_mut().stat),
            None => return Err(not_found()),
        }
        Ok(())
    }

    /// Follows final symlink components (target relative to the link's
    /// directory, or taken from the root when absolute) and returns the
    /// resolved path.  Intermediate components must be directories.
    fn resolve_follow(&self, path: &Path) -> io::Result<PathBuf> {
        let root = self.root.borrow();
        let mut current = path.to_path_buf();

        for _ in 0..SYMLINK_HOPS_MAX {
            if is_root(&current) {
                return Ok(current);
            }

            let (parent, name) = split(&current)?;
            let dir = dir_ref(&root, parent)?;
            let target = match dir.entries.get(name) {
                Some(Node::Leaf(l)) => match &l.borrow().content {
                    LeafContent::Symlink(target) => target.clone(),
                    LeafContent::Regular(..) => return Ok(current),
                },
                Some(Node::Directory(..)) => return Ok(current),
                None => return Err(not_found()),
            };

            let target = Path::new(&target);
            current = if target.is_absolute() {
                normalize_path(target)
            } else {
                normalize_path(&parent.join(target))
            };
        }

        Err(io::Error::other("too many levels of symbolic links"))
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.update_stat(path, |stat| {
            stat.uid = uid;
            stat.gid = gid;
            // Linux clears the setuid/setgid bits when a non-directory
            // changes owner.
            if stat.mode & S_IFMT != S_IFDIR {
                stat.mode &= !(S_ISUID | S_ISGID);
            }
        })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs::new()
    }
}

impl Filesystem for MemFs {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            symlinks: true,
            hard_links: true,
            ownership: true,
        }
    }

    fn lstat(&self, path: &Path) -> io::Result<Metadata> {
        let root = self.root.borrow();
        if is_root(path) {
            return Ok(dir_metadata(&root));
        }
        let (parent, name) = split(path)?;
        let dir = dir_ref(&root, parent)?;
        match dir.entries.get(name) {
            Some(Node::Directory(d)) => Ok(dir_metadata(d)),
            Some(Node::Leaf(l)) => Ok(leaf_metadata(&l.borrow())),
            None => Err(not_found()),
        }
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        if is_root(path) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        let (parent, name) = split(path)?;
        let mut root = self.root.borrow_mut();
        let dir = dir_mut(&mut root, parent)?;
        if dir.entries.contains_key(name) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        let stat = Stat {
            mode: S_IFDIR | (perm & 0o7777),
            uid: 0,
            gid: 0,
            mtime: now(),
            ino: self.alloc_ino(),
        };
        dir.stat.mtime = now();
        dir.entries.insert(
            name.to_os_string(),
            Node::Directory(Dir {
                stat,
                entries: BTreeMap::new(),
            }),
        );
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &mut dyn Read) -> io::Result<()> {
        if is_root(path) {
            return Err(io::ErrorKind::IsADirectory.into());
        }
        let mut content = Vec::new();
        data.read_to_end(&mut content)?;

        let (parent, name) = split(path)?;
        let mut root = self.root.borrow_mut();

        // Create missing parent directories.
        let mut dir: &mut Dir = &mut root;
        for component in parent.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(n) => {
                    match dir.entries.get(n) {
                        Some(Node::Directory(..)) => {}
                        Some(_) => return Err(io::ErrorKind::NotADirectory.into()),
                        None => {
                            let stat = Stat {
                                mode: S_IFDIR | 0o777,
                                uid: 0,
                                gid: 0,
                                mtime: now(),
                                ino: self.alloc_ino(),
                            };
                            dir.stat.mtime = now();
                            dir.entries.insert(
                                n.to_os_string(),
                                Node::Directory(Dir {
                                    stat,
                                    entries: BTreeMap::new(),
                                }),
                            );
                        }
                    }
                    dir = match dir.entries.get_mut(n) {
                        Some(Node::Directory(d)) => d,
                        _ => return Err(io::ErrorKind::NotADirectory.into()),
                    };
                }
                _ => return Err(invalid_path()),
            }
        }

        match dir.entries.get_mut(name) {
            Some(Node::Leaf(l)) => {
                let mut leaf = l.borrow_mut();
                match &mut leaf.content {
                    LeafContent::Regular(existing) => {
                        *existing = content;
                        leaf.stat.mtime = now();
                    }
                    LeafContent::Symlink(..) => {
                        return Err(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "writing through a symlink",
                        ))
                    }
                }
            }
            Some(Node::Directory(..)) => return Err(io::ErrorKind::IsADirectory.into()),
            None => {
                let stat = Stat {
                    mode: S_IFREG | 0o666,
                    uid: 0,
                    gid: 0,
                    mtime: now(),
                    ino: self.alloc_ino(),
                };
                dir.stat.mtime = now();
                dir.entries.insert(
                    name.to_os_string(),
                    Node::Leaf(Rc::new(RefCell::new(Leaf {
                        stat,
                        content: LeafContent::Regular(content),
                    }))),
                );
            }
        }
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let root = self.root.borrow();
        if is_root(path) {
            return Err(io::ErrorKind::IsADirectory.into());
        }
        let (parent, name) = split(path)?;
        let dir = dir_ref(&root, parent)?;
        match dir.entries.get(name) {
            Some(Node::Leaf(l)) => match &l.borrow().content {
                LeafContent::Regular(data) => Ok(data.clone()),
                LeafContent::Symlink(..) => {
                    Err(io::Error::new(io::ErrorKind::InvalidInput, "is a symlink"))
                }
            },
            Some(Node::Directory(..)) => Err(io::ErrorKind::IsADirectory.into()),
            None => Err(not_found()),
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if is_root(path) {
            return Err(invalid_path());
        }
        let (parent, name) = split(path)?;
        let mut root = self.root.borrow_mut();
        let dir = dir_mut(&mut root, parent)?;
        match dir.entries.get(name) {
            Some(Node::Directory(d)) if !d.entries.is_empty() => {
                return Err(io::ErrorKind::DirectoryNotEmpty.into())
            }
            Some(_) => {}
            None => return Err(not_found()),
        }
        dir.entries.remove(name);
        dir.stat.mtime = now();
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        if is_root(path) {
            return Err(invalid_path());
        }
        let (parent, name) = split(path)?;
        let mut root = self.root.borrow_mut();
        let dir = match dir_mut(&mut root, parent) {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };
        if dir.entries.remove(name).is_some() {
            dir.stat.mtime = now();
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.update_stat(path, |stat| {
            stat.mode = (stat.mode & S_IFMT) | (mode & 0o7777);
        })
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let resolved = self.resolve_follow(path)?;
        self.set_owner(&resolved, uid, gid)
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.set_owner(path, uid, gid)
    }

    fn chtimes(&self, path: &Path, _atime: i64, mtime: i64) -> io::Result<()> {
        self.update_stat(path, |stat| stat.mtime = mtime)
    }

    fn symlink(&self, target: &OsStr, link: &Path) -> io::Result<()> {
        if is_root(link) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        let (parent, name) = split(link)?;
        let mut root = self.root.borrow_mut();
        let dir = dir_mut(&mut root, parent)?;
        if dir.entries.contains_key(name) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        let stat = Stat {
            mode: S_IFLNK | 0o777,
            uid: 0,
            gid: 0,
            mtime: now(),
            ino: self.alloc_ino(),
        };
        dir.stat.mtime = now();
        dir.entries.insert(
            name.to_os_string(),
            Node::Leaf(Rc::new(RefCell::new(Leaf {
                stat,
                content: LeafContent::Symlink(target.to_os_string()),
            }))),
        );
        Ok(())
    }

    fn readlink(&self, path: &Path) -> io::Result<OsString> {
        let root = self.root.borrow();
        if is_root(path) {
            return Err(invalid_path());
        }
        let (parent, name) = split(path)?;
        let dir = dir_ref(&root, parent)?;
        match dir.entries.get(name) {
            Some(Node::Leaf(l)) => match &l.borrow().content {
                LeafContent::Symlink(target) => Ok(target.clone()),
                LeafContent::Regular(..) => {
                    Err(io::Error::new(io::ErrorKind::InvalidInput, "not a symlink"))
                }
            },
            Some(Node::Directory(..)) => {
                Err(io::Error::new(io::ErrorKind::InvalidInput, "not a symlink"))
            }
            None => Err(not_found()),
        }
    }

    fn hardlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        if is_root(target) || is_root(link) {
            return Err(invalid_path());
        }
        let mut root = self.root.borrow_mut();

        let leaf = {
            let (parent, name) = split(target)?;
            let dir = dir_ref(&root, parent)?;
            match dir.entries.get(name) {
                Some(Node::Leaf(l)) => Rc::clone(l),
                Some(Node::Directory(..)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "hard link to a directory",
                    ))
                }
                None => return Err(not_found()),
            }
        };

        let (parent, name) = split(link)?;
        let dir = dir_mut(&mut root, parent)?;
        if dir.entries.contains_key(name) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        dir.stat.mtime = now();
        dir.entries.insert(name.to_os_string(), Node::Leaf(leaf));
        Ok(())
    }

    fn all_paths(&self) -> io::Result<Vec<PathBuf>> {
        fn walk(dir: &Dir, prefix: &Path, out: &mut Vec<PathBuf>) {
            for (name, node) in &dir.entries {
                let path = prefix.join(name);
                out.push(path.clone());
                if let Node::Directory(d) = node {
                    walk(d, &path, out);
                }
            }
        }

        let root = self.root.borrow();
        let mut out = vec![PathBuf::from(".")];
        walk(&root, Path::new(""), &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_and_lstat() {
        let fs = MemFs::new();
        fs.mkdir(Path::new("etc"), 0o755).unwrap();
        let meta = fs.lstat(Path::new("etc")).unwrap();
        assert_eq!(meta.kind, FileKind::Directory);
        assert_eq!(meta.mode, S_IFDIR | 0o755);

        assert!(fs.mkdir(Path::new("etc"), 0o755).is_err());
        assert!(fs.mkdir(Path::new("missing/dir"), 0o755).is_err());
    }

    #[test]
    fn write_creates_parents() {
        let fs = MemFs::new();
        fs.write_file(Path::new("a/b/c.txt"), &mut &b"hi"[..]).unwrap();
        assert_eq!(fs.lstat(Path::new("a")).unwrap().kind, FileKind::Directory);
        assert_eq!(fs.read_file(Path::new("a/b/c.txt")).unwrap(), b"hi");
        assert_eq!(fs.lstat(Path::new("a/b/c.txt")).unwrap().size, 2);
    }

    #[test]
    fn write_preserves_mode_and_ino() {
        let fs = MemFs::new();
        fs.write_file(Path::new("f"), &mut &b"one"[..]).unwrap();
        fs.chmod(Path::new("f"), 0o640).unwrap();
        let before = fs.lstat(Path::new("f")).unwrap();
        fs.write_file(Path::new("f"), &mut &b"two!"[..]).unwrap();
        let after = fs.lstat(Path::new("f")).unwrap();
        assert_eq!(after.mode, S_IFREG | 0o640);
        assert_eq!(after.ino, before.ino);
        assert_eq!(after.size, 4);
    }

    #[test]
    fn child_mutation_touches_parent_mtime() {
        let fs = MemFs::new();
        fs.mkdir(Path::new("etc"), 0o755).unwrap();
        fs.chtimes(Path::new("etc"), 1000, 1000).unwrap();
        fs.write_file(Path::new("etc/new"), &mut &b"x"[..]).unwrap();
        assert_ne!(fs.lstat(Path::new("etc")).unwrap().mtime, 1000);

        fs.chtimes(Path::new("etc"), 1000, 1000).unwrap();
        fs.remove(Path::new("etc/new")).unwrap();
        assert_ne!(fs.lstat(Path::new("etc")).unwrap().mtime, 1000);
    }

    #[test]
    fn remove_refuses_nonempty_dir() {
        let fs = MemFs::new();
        fs.write_file(Path::new("d/f"), &mut &b"x"[..]).unwrap();
        assert!(fs.remove(Path::new("d")).is_err());
        fs.remove_all(Path::new("d")).unwrap();
        assert!(fs.lstat(Path::new("d")).is_err());
        // absent paths are fine
        fs.remove_all(Path::new("d")).unwrap();
    }

    #[test]
    fn hardlinks_share_inode() {
        let fs = MemFs::new();
        fs.write_file(Path::new("a"), &mut &b"x"[..]).unwrap();
        fs.hardlink(Path::new("a"), Path::new("b")).unwrap();
        let a = fs.lstat(Path::new("a")).unwrap();
        let b = fs.lstat(Path::new("b")).unwrap();
        assert_eq!(a.ino, b.ino);

        fs.chmod(Path::new("b"), 0o600).unwrap();
        assert_eq!(fs.lstat(Path::new("a")).unwrap().mode, S_IFREG | 0o600);
    }

    #[test]
    fn chown_follows_symlinks_lchown_does_not() {
        let fs = MemFs::new();
        fs.write_file(Path::new("file"), &mut &b"x"[..]).unwrap();
        fs.symlink(OsStr::new("file"), Path::new("link")).unwrap();

        fs.chown(Path::new("link"), 10, 20).unwrap();
        let file = fs.lstat(Path::new("file")).unwrap();
        assert_eq!((file.uid, file.gid), (10, 20));
        let link = fs.lstat(Path::new("link")).unwrap();
        assert_eq!((link.uid, link.gid), (0, 0));

        fs.lchown(Path::new("link"), 30, 40).unwrap();
        let link = fs.lstat(Path::new("link")).unwrap();
        assert_eq!((link.uid, link.gid), (30, 40));
        let file = fs.lstat(Path::new("file")).unwrap();
        assert_eq!((file.uid, file.gid), (10, 20));
    }

    #[test]
    fn chown_clears_setgid_on_files() {
        let fs = MemFs::new();
        fs.write_file(Path::new("f"), &mut &b"x"[..]).unwrap();
        fs.chmod(Path::new("f"), 0o2777).unwrap();
        fs.chown(Path::new("f"), 1000, 1001).unwrap();
        assert_eq!(fs.lstat(Path::new("f")).unwrap().mode, S_IFREG | 0o777);

        fs.mkdir(Path::new("d"), 0o755).unwrap();
        fs.chmod(Path::new("d"), 0o2755).unwrap();
        fs.chown(Path::new("d"), 1000, 1001).unwrap();
        assert_eq!(fs.lstat(Path::new("d")).unwrap().mode, S_IFDIR | 0o2755);
    }

    #[test]
    fn chtimes_does_not_follow() {
        let fs = MemFs::new();
        fs.write_file(Path::new("file"), &mut &b"x"[..]).unwrap();
        fs.chtimes(Path::new("file"), 500, 500).unwrap();
        fs.symlink(OsStr::new("file"), Path::new("link")).unwrap();
        fs.chtimes(Path::new("link"), 900, 900).unwrap();
        assert_eq!(fs.lstat(Path::new("file")).unwrap().mtime, 500);
        assert_eq!(fs.lstat(Path::new("link")).unwrap().mtime, 900);
    }

    #[test]
    fn all_paths_lists_everything() {
        let fs = MemFs::new();
        fs.write_file(Path::new("etc/conf"), &mut &b"x"[..]).unwrap();
        fs.mkdir(Path::new("var"), 0o755).unwrap();
        let mut paths = fs.all_paths().unwrap();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("."),
                PathBuf::from("etc"),
                PathBuf::from("etc/conf"),
                PathBuf::from("var"),
            ]
        );
    }
}
