//! Update records emitted by the reconciliation engine.

use std::{ffi::OsString, fmt, path::PathBuf};

/// One observable change applied to a path.
///
/// `added` and `deleted` are mutually exclusive.  The optional attribute
/// fields are present iff the corresponding attribute was changed by this
/// step.  An update with no flag set and no attribute present is *empty* and
/// is never emitted by the engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PathUpdate {
    /// Normalized relative path of the entry.
    pub path: PathBuf,
    /// The entry was created, or its contents/target replaced.
    pub added: bool,
    /// The entry was removed.
    pub deleted: bool,
    /// Full `st_mode` applied to the entry.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Modification time applied, in seconds since the Unix epoch.
    pub mtime: Option<i64>,
    /// Target of a newly created symlink.
    pub link: Option<OsString>,
}

impl PathUpdate {
    pub(crate) fn new(path: PathBuf) -> Self {
        PathUpdate {
            path,
            ..PathUpdate::default()
        }
    }

    /// True when nothing was observed: no flag set, no attribute changed.
    pub fn is_empty(&self) -> bool {
        !self.added
            && !self.deleted
            && self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.mtime.is_none()
            && self.link.is_none()
    }
}

impl fmt::Display for PathUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.added {
            return match &self.link {
                Some(link) => write!(
                    f,
                    "added {} -> {}",
                    self.path.display(),
                    link.to_string_lossy()
                ),
                None => write!(f, "added {}", self.path.display()),
            };
        }
        if self.deleted {
            return write!(f, "deleted {}", self.path.display());
        }

        write!(f, "updated {}", self.path.display())?;
        if let Some(mode) = self.mode {
            write!(f, " mode={mode:o}")?;
        }
        if let Some(uid) = self.uid {
            write!(f, " uid={uid}")?;
        }
        if let Some(gid) = self.gid {
            write!(f, " gid={gid}")?;
        }
        if let Some(mtime) = self.mtime {
            write!(f, " mtime={mtime}")?;
        }
        Ok(())
    }
}

/// Counters over a stream of updates.
///
/// A replacement counts as an add: the `added` flag tracks entries whose
/// contents were (re)written, not just net-new paths.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl Summary {
    pub fn record(&mut self, upd: &PathUpdate) {
        if upd.added {
            self.added += 1;
        } else if upd.deleted {
            self.deleted += 1;
        } else {
            self.updated += 1;
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added: {} updated: {} deleted: {}",
            self.added, self.updated, self.deleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update() {
        let upd = PathUpdate::new(PathBuf::from("etc/passwd"));
        assert!(upd.is_empty());

        let upd = PathUpdate {
            mtime: Some(0),
            ..PathUpdate::new(PathBuf::from("etc/passwd"))
        };
        assert!(!upd.is_empty());
    }

    #[test]
    fn display() {
        let mut upd = PathUpdate::new(PathBuf::from("etc/passwd"));
        upd.added = true;
        assert_eq!(upd.to_string(), "added etc/passwd");

        upd.link = Some("target".into());
        assert_eq!(upd.to_string(), "added etc/passwd -> target");

        let mut upd = PathUpdate::new(PathBuf::from("etc/passwd"));
        upd.deleted = true;
        assert_eq!(upd.to_string(), "deleted etc/passwd");

        let upd = PathUpdate {
            mode: Some(0o100755),
            uid: Some(1000),
            mtime: Some(1735689600),
            ..PathUpdate::new(PathBuf::from("bin/sh"))
        };
        assert_eq!(
            upd.to_string(),
            "updated bin/sh mode=100755 uid=1000 mtime=1735689600"
        );
    }

    #[test]
    fn summary_counters() {
        let mut summary = Summary::default();
        summary.record(&PathUpdate {
            added: true,
            ..PathUpdate::default()
        });
        summary.record(&PathUpdate {
            deleted: true,
            ..PathUpdate::default()
        });
        summary.record(&PathUpdate {
            mode: Some(0o755),
            ..PathUpdate::default()
        });
        assert_eq!(
            summary,
            Summary {
                added: 1,
                updated: 1,
                deleted: 1
            }
        );
        assert_eq!(summary.to_string(), "added: 1 updated: 1 deleted: 1");
    }
}
