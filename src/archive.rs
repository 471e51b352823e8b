//! Serializing a destination filesystem back into a tar stream.

use std::{
    collections::HashMap,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tar::{Builder, EntryType, Header};

use crate::vfs::{FileKind, Filesystem};

/// Writes every entry of `fs` except the root itself into a tar stream, in
/// lexicographic path order.
///
/// When the backend reports inodes, the first path seen for an inode carries
/// the file contents and every later path becomes a hardlink entry referring
/// back to it.
pub fn write_tar<F: Filesystem, W: Write>(fs: &F, writer: W) -> io::Result<()> {
    let mut builder = Builder::new(writer);
    let hard_links = fs.capabilities().hard_links;
    let mut seen: HashMap<u64, PathBuf> = HashMap::new();

    let mut paths = fs.all_paths()?;
    paths.sort();

    for path in paths {
        if path == Path::new(".") {
            continue;
        }
        let meta = fs.lstat(&path)?;

        let mut header = Header::new_gnu();
        header.set_mode(meta.mode & 0o7777);
        header.set_uid(meta.uid as u64);
        header.set_gid(meta.gid as u64);
        header.set_mtime(meta.mtime.max(0) as u64);
        header.set_size(0);

        match meta.kind {
            FileKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                builder.append_data(&mut header, &path, io::empty())?;
            }
            FileKind::Regular => {
                if hard_links {
                    if let Some(first) = seen.get(&meta.ino) {
                        header.set_entry_type(EntryType::Link);
                        builder.append_link(&mut header, &path, first)?;
                        continue;
                    }
                    seen.insert(meta.ino, path.clone());
                }
                let data = fs.read_file(&path)?;
                header.set_entry_type(EntryType::Regular);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, &path, data.as_slice())?;
            }
            FileKind::Symlink => {
                let target = fs.readlink(&path)?;
                header.set_entry_type(EntryType::Symlink);
                builder.append_link(&mut header, &path, Path::new(&target))?;
            }
            FileKind::Other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot archive {}", path.display()),
                ));
            }
        }
    }

    builder.into_inner()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use anyhow::Result;

    use super::*;
    use crate::memfs::MemFs;

    #[test]
    fn round_trip_entries() -> Result<()> {
        let fs = MemFs::new();
        fs.mkdir(Path::new("etc"), 0o755)?;
        fs.write_file(Path::new("etc/conf"), &mut &b"data"[..])?;
        fs.chtimes(Path::new("etc/conf"), 1000, 1000)?;
        fs.symlink(OsStr::new("conf"), Path::new("etc/alias"))?;
        fs.hardlink(Path::new("etc/conf"), Path::new("etc/hard"))?;

        let mut bytes = Vec::new();
        write_tar(&fs, &mut bytes)?;

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut records = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let kind = entry.header().entry_type();
            let link = entry.link_name()?.map(|l| l.into_owned());
            let mut body = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut body)?;
            records.push((path, kind, link, body));
        }

        assert_eq!(
            records,
            vec![
                (
                    PathBuf::from("etc"),
                    EntryType::Directory,
                    None,
                    Vec::new()
                ),
                (
                    PathBuf::from("etc/alias"),
                    EntryType::Symlink,
                    Some(PathBuf::from("conf")),
                    Vec::new()
                ),
                (
                    PathBuf::from("etc/conf"),
                    EntryType::Regular,
                    None,
                    b"data".to_vec()
                ),
                (
                    PathBuf::from("etc/hard"),
                    EntryType::Link,
                    Some(PathBuf::from("etc/conf")),
                    Vec::new()
                ),
            ]
        );
        Ok(())
    }
}
