//! A destination filesystem rooted at a host directory.

use std::{
    ffi::{OsStr, OsString},
    fs,
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use rustix::fs::{chownat, mkdirat, statat, AtFlags, Gid, Uid, CWD};

use crate::vfs::{Capabilities, FileKind, Filesystem, Metadata};

/// A directory on the host filesystem.
///
/// All operations resolve against the root passed to [`DirFs::new`].
/// Ownership is only advertised when running as root; unprivileged callers
/// should disable ownership syncing.
#[derive(Debug)]
pub struct DirFs {
    root: PathBuf,
}

fn uid(raw: u32) -> Uid {
    unsafe { Uid::from_raw(raw) }
}

fn gid(raw: u32) -> Gid {
    unsafe { Gid::from_raw(raw) }
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<DirFs> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::ErrorKind::NotADirectory.into());
        }
        Ok(DirFs { root })
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl Filesystem for DirFs {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            symlinks: true,
            hard_links: true,
            ownership: rustix::process::geteuid().is_root(),
        }
    }

    fn lstat(&self, path: &Path) -> io::Result<Metadata> {
        let buf = statat(CWD, self.full(path), AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(Metadata {
            kind: FileKind::from_mode(buf.st_mode as u32),
            size: buf.st_size as u64,
            mode: buf.st_mode as u32,
            mtime: buf.st_mtime as i64,
            uid: buf.st_uid,
            gid: buf.st_gid,
            ino: buf.st_ino as u64,
        })
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        mkdirat(CWD, self.full(path), perm.into())?;
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &mut dyn Read) -> io::Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&full)?;
        io::copy(data, &mut file)?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.full(path))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let full = self.full(path);
        if self.lstat(path)?.kind == FileKind::Directory {
            fs::remove_dir(full)
        } else {
            fs::remove_file(full)
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let full = self.full(path);
        match self.lstat(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
            Ok(m) if m.kind == FileKind::Directory => fs::remove_dir_all(full),
            Ok(_) => fs::remove_file(full),
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.full(path), fs::Permissions::from_mode(mode & 0o7777))
    }

    fn chown(&self, path: &Path, owner: u32, group: u32) -> io::Result<()> {
        chownat(
            CWD,
            self.full(path),
            Some(uid(owner)),
            Some(gid(group)),
            AtFlags::empty(),
        )?;
        Ok(())
    }

    fn lchown(&self, path: &Path, owner: u32, group: u32) -> io::Result<()> {
        chownat(
            CWD,
            self.full(path),
            Some(uid(owner)),
            Some(gid(group)),
            AtFlags::SYMLINK_NOFOLLOW,
        )?;
        Ok(())
    }

    fn chtimes(&self, path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
        filetime::set_symlink_file_times(
            self.full(path),
            FileTime::from_unix_time(atime, 0),
            FileTime::from_unix_time(mtime, 0),
        )
    }

    fn symlink(&self, target: &OsStr, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.full(link))
    }

    fn readlink(&self, path: &Path) -> io::Result<OsString> {
        Ok(fs::read_link(self.full(path))?.into_os_string())
    }

    fn hardlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(self.full(target), self.full(link))
    }

    fn all_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut out = vec![PathBuf::from(".")];
        let mut pending = vec![PathBuf::new()];
        while let Some(rel) = pending.pop() {
            for entry in fs::read_dir(self.root.join(&rel))? {
                let entry = entry?;
                let path = rel.join(entry.file_name());
                if entry.file_type()?.is_dir() {
                    pending.push(path.clone());
                }
                out.push(path);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{S_IFDIR, S_IFLNK, S_IFREG};

    #[test]
    fn basic_operations() {
        let td = tempfile::tempdir().unwrap();
        let fs = DirFs::new(td.path()).unwrap();

        fs.mkdir(Path::new("etc"), 0o755).unwrap();
        fs.write_file(Path::new("etc/conf"), &mut &b"data"[..])
            .unwrap();
        fs.chmod(Path::new("etc/conf"), 0o640).unwrap();
        fs.chtimes(Path::new("etc/conf"), 1000, 1000).unwrap();

        let meta = fs.lstat(Path::new("etc/conf")).unwrap();
        assert_eq!(meta.kind, FileKind::Regular);
        assert_eq!(meta.size, 4);
        assert_eq!(meta.mode, S_IFREG | 0o640);
        assert_eq!(meta.mtime, 1000);
        assert_eq!(fs.read_file(Path::new("etc/conf")).unwrap(), b"data");

        assert_eq!(
            fs.lstat(Path::new("etc")).unwrap().mode & S_IFDIR,
            S_IFDIR
        );

        let mut paths = fs.all_paths().unwrap();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("."),
                PathBuf::from("etc"),
                PathBuf::from("etc/conf"),
            ]
        );
    }

    #[test]
    fn symlinks_and_hardlinks() {
        let td = tempfile::tempdir().unwrap();
        let fs = DirFs::new(td.path()).unwrap();

        fs.write_file(Path::new("target"), &mut &b"x"[..]).unwrap();
        fs.symlink(OsStr::new("target"), Path::new("sym")).unwrap();
        assert_eq!(fs.lstat(Path::new("sym")).unwrap().kind, FileKind::Symlink);
        assert_eq!(
            fs.lstat(Path::new("sym")).unwrap().mode & S_IFLNK,
            S_IFLNK
        );
        assert_eq!(fs.readlink(Path::new("sym")).unwrap(), "target");

        fs.hardlink(Path::new("target"), Path::new("hard")).unwrap();
        assert_eq!(
            fs.lstat(Path::new("target")).unwrap().ino,
            fs.lstat(Path::new("hard")).unwrap().ino
        );
    }

    #[test]
    fn symlink_times_do_not_follow() {
        let td = tempfile::tempdir().unwrap();
        let fs = DirFs::new(td.path()).unwrap();

        fs.write_file(Path::new("file"), &mut &b"x"[..]).unwrap();
        fs.chtimes(Path::new("file"), 500, 500).unwrap();
        fs.symlink(OsStr::new("file"), Path::new("link")).unwrap();
        fs.chtimes(Path::new("link"), 900, 900).unwrap();
        assert_eq!(fs.lstat(Path::new("file")).unwrap().mtime, 500);
        assert_eq!(fs.lstat(Path::new("link")).unwrap().mtime, 900);
    }

    #[test]
    fn remove_all_tolerates_absence() {
        let td = tempfile::tempdir().unwrap();
        let fs = DirFs::new(td.path()).unwrap();
        fs.remove_all(Path::new("missing")).unwrap();

        fs.write_file(Path::new("d/f"), &mut &b"x"[..]).unwrap();
        assert!(fs.remove(Path::new("d")).is_err());
        fs.remove_all(Path::new("d")).unwrap();
        assert!(fs.lstat(Path::new("d")).is_err());
    }
}
