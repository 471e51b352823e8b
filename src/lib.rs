//! Reconcile a live filesystem tree against a declarative snapshot delivered
//! as a streaming tar archive.
//!
//! [`Syncer`] brings a destination [`Filesystem`] to bit-for-bit equivalence
//! with the archive (contents, mode bits, ownership, mtimes, symlink targets
//! and hardlink identity), yielding one [`PathUpdate`] per observed change
//! and preserving directory mtimes across mutations of their children.
//!
//! ```
//! use tarsync::{memfs::MemFs, Syncer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = tar::Builder::new(Vec::new());
//! let mut header = tar::Header::new_gnu();
//! header.set_entry_type(tar::EntryType::Regular);
//! header.set_path("hello.txt")?;
//! header.set_mode(0o644);
//! header.set_uid(0);
//! header.set_gid(0);
//! header.set_mtime(1735689600);
//! header.set_size(6);
//! header.set_cksum();
//! builder.append(&header, &b"hello\n"[..])?;
//! let bytes = builder.into_inner()?;
//!
//! let fs = MemFs::new();
//! let mut archive = tar::Archive::new(bytes.as_slice());
//! let mut syncer = Syncer::new(&fs, &mut archive)?;
//! let updates = syncer.run()?;
//! assert_eq!(updates.len(), 1);
//! assert!(updates[0].added);
//! # Ok(()) }
//! ```

pub mod archive;
#[cfg(unix)]
pub mod dirfs;
pub mod memfs;
pub mod sync;
pub mod update;
pub mod vfs;

pub use sync::{Options, SyncError, Syncer};
pub use update::{PathUpdate, Summary};
pub use vfs::{Capabilities, FileKind, Filesystem, Metadata};
