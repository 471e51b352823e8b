//! The destination filesystem abstraction.
//!
//! The reconciliation engine drives every destination (an in-memory tree, a
//! directory on the host, a mounted disk image) through this one trait.  The
//! operations mirror the POSIX calls of the same name; paths are always
//! relative to the filesystem root, with `"."` naming the root itself.

use std::{
    ffi::{OsStr, OsString},
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Type bits of `st_mode`.
pub const S_IFMT: u32 = 0o170000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;

/// Set-user-ID bit.
pub const S_ISUID: u32 = 0o4000;
/// Set-group-ID bit.
pub const S_ISGID: u32 = 0o2000;
/// Sticky bit.
pub const S_ISVTX: u32 = 0o1000;

/// What a filesystem backend is able to do.
///
/// Checked once, when the engine is constructed: every option enabled on the
/// engine must be covered by the corresponding capability here.  A backend
/// should only advertise what it genuinely implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `symlink`, `readlink` and `lchown` work.  `lchown` is required
    /// separately from `chown` because symlink ownership must target the
    /// link itself, never its referent.
    pub symlinks: bool,
    /// `hardlink` works and `Metadata::ino` identifies inodes.
    pub hard_links: bool,
    /// `chown`/`lchown` work and `Metadata::uid`/`gid` are meaningful.
    pub ownership: bool,
}

/// The type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Anything else (device node, fifo, socket).  The engine replaces such
    /// entries wholesale; it never creates them.
    Other,
}

impl FileKind {
    /// Derives the kind from the type bits of an `st_mode` value.
    pub fn from_mode(mode: u32) -> FileKind {
        match mode & S_IFMT {
            S_IFREG => FileKind::Regular,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// Metadata for one filesystem entry, as reported by [`Filesystem::lstat`].
///
/// `uid` and `gid` are meaningful only when the backend advertises
/// [`Capabilities::ownership`], and `ino` only when it advertises
/// [`Capabilities::hard_links`].
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: FileKind,
    /// Content size in bytes (0 for directories).
    pub size: u64,
    /// Full `st_mode`: type bits, setuid/setgid/sticky, permissions.
    pub mode: u32,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("filesystem does not support {what}"),
    )
}

/// A destination filesystem.
///
/// Methods take `&self`; backends use interior mutability where needed.  The
/// capability-gated operations (`symlink`, `readlink`, `lchown`, `hardlink`)
/// have default bodies returning [`io::ErrorKind::Unsupported`] so a backend
/// only implements what its [`Capabilities`] advertise.
pub trait Filesystem {
    /// What this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// Stat without following a final symlink component.
    fn lstat(&self, path: &Path) -> io::Result<Metadata>;

    /// Create a single directory level with the given 0o777 permission bits.
    /// Fails if the entry already exists.
    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Create or truncate a regular file and stream `data` into it.  Missing
    /// parent directories are created.
    fn write_file(&self, path: &Path, data: &mut dyn Read) -> io::Result<()>;

    /// Read the full contents of a regular file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Remove a file, symlink, or empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a path recursively.  Succeeds if the path is already absent.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Apply the low 12 mode bits.  The type bits of `mode` are ignored.
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Change ownership, following symlinks.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Change ownership of the entry itself, never its referent.
    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let _ = (path, uid, gid);
        Err(unsupported("lchown"))
    }

    /// Set access and modification times (seconds since the Unix epoch)
    /// without following a final symlink component.
    fn chtimes(&self, path: &Path, atime: i64, mtime: i64) -> io::Result<()>;

    /// Create a symlink at `link` pointing at `target`.
    fn symlink(&self, target: &OsStr, link: &Path) -> io::Result<()> {
        let _ = (target, link);
        Err(unsupported("symlinks"))
    }

    /// Read a symlink's target.
    fn readlink(&self, path: &Path) -> io::Result<OsString> {
        let _ = path;
        Err(unsupported("symlinks"))
    }

    /// Create a hard link at `link` to the existing file at `target`.
    fn hardlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let _ = (target, link);
        Err(unsupported("hard links"))
    }

    /// Enumerate every path in the tree, including `"."` for the root.  The
    /// order is unspecified.  Backends with a native enumeration primitive
    /// should use it here.
    fn all_paths(&self) -> io::Result<Vec<PathBuf>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o010644), FileKind::Other); // fifo
    }

    #[test]
    fn special_bits_do_not_affect_kind() {
        assert_eq!(
            FileKind::from_mode(S_IFREG | S_ISUID | S_ISGID | S_ISVTX | 0o777),
            FileKind::Regular
        );
    }
}
