// src/cache.rs

//! On-disk cache layout and the advisory lockfile.
//!
//! Everything chariot persists lives under one cache root:
//!
//! ```text
//! <cache>/chariot.lock                       advisory lockfile
//! <cache>/{source,host,target}/<name>/       per-recipe artifacts
//! <cache>/deps/{source,host,target}/         scratch, cleaned per recipe
//! <cache>/sets/rootfs/                       base layer
//! <cache>/sets/<pkg>/...                     image-set layers
//! <cache>/patches/                           user-supplied patchfiles
//! ```
//!
//! The lock is held for the lifetime of the `Cache` value; no two engine
//! instances operate on the same cache simultaneously.

use crate::error::{Error, Result};
use crate::recipe::Namespace;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCKFILE: &str = "chariot.lock";

#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    _lock: Option<Flock<File>>,
}

impl Cache {
    /// Open (creating if necessary) the cache at `root`, acquiring the
    /// exclusive advisory lock unless told not to. Contention is fatal.
    pub fn open(root: impl AsRef<Path>, acquire_lock: bool) -> Result<Cache> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| {
            Error::IoError(format!("failed to create cache `{}`: {}", root.display(), err))
        })?;

        let lock = if acquire_lock {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(root.join(LOCKFILE))
                .map_err(|err| Error::IoError(format!("failed to open lockfile: {}", err)))?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => Some(lock),
                Err((_, errno)) => return Err(Error::CacheLocked(errno.to_string())),
            }
        } else {
            None
        };

        Ok(Cache { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one recipe's artifacts. Its existence implies a
    /// successful prior build.
    pub fn recipe_dir(&self, namespace: Namespace, name: &str) -> PathBuf {
        self.root.join(namespace.as_str()).join(name)
    }

    pub fn deps_source_dir(&self) -> PathBuf {
        self.root.join("deps").join("source")
    }

    pub fn deps_host_dir(&self) -> PathBuf {
        self.root.join("deps").join("host")
    }

    pub fn deps_target_dir(&self) -> PathBuf {
        self.root.join("deps").join("target")
    }

    pub fn sets_dir(&self) -> PathBuf {
        self.root.join("sets")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.sets_dir().join("rootfs")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        let cache = Cache::open(&root, false).unwrap();
        assert!(root.exists());
        assert_eq!(cache.root(), root);
    }

    #[test]
    fn test_lock_contention_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let _held = Cache::open(tmp.path(), true).unwrap();
        let err = Cache::open(tmp.path(), true).unwrap_err();
        assert!(matches!(err, Error::CacheLocked(_)));
    }

    #[test]
    fn test_no_lockfile_escape_hatch() {
        let tmp = TempDir::new().unwrap();
        let _held = Cache::open(tmp.path(), true).unwrap();
        Cache::open(tmp.path(), false).unwrap();
    }

    #[test]
    fn test_path_layout() {
        let tmp = TempDir::new().unwrap();
        let cache = Cache::open(tmp.path(), false).unwrap();
        assert_eq!(
            cache.recipe_dir(Namespace::Host, "gcc"),
            tmp.path().join("host/gcc")
        );
        assert_eq!(cache.rootfs_dir(), tmp.path().join("sets/rootfs"));
        assert_eq!(cache.deps_target_dir(), tmp.path().join("deps/target"));
    }
}
