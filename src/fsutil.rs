// src/fsutil.rs

//! Path and I/O helpers: recursive clean, copy, and hardlink trees.
//!
//! Dependency staging overlays several install trees into one directory, so
//! `copy_recursive` keeps the first file it sees on a conflicting path and
//! only reports the overlap. `link_recursive` clones a rootfs layer by
//! hardlinking every file, sharing inodes with the parent layer.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Remove a file or directory tree if it exists.
pub fn clean(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(Error::IoError(format!(
                "failed to stat `{}`: {}",
                path.display(),
                err
            )))
        }
        Ok(meta) => meta,
    };

    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|err| Error::IoError(format!("failed to remove `{}`: {}", path.display(), err)))
}

/// Remove a directory tree and recreate it empty.
pub fn recreate_dir(path: impl AsRef<Path>) -> Result<()> {
    clean(&path)?;
    fs::create_dir_all(&path).map_err(|err| {
        Error::IoError(format!(
            "failed to create `{}`: {}",
            path.as_ref().display(),
            err
        ))
    })
}

/// Copy a directory tree into `dest`, which may already be populated.
///
/// Existing files win: a file that already exists at the destination is kept
/// and the overlap is reported as a conflict when `warn_conflicts` is set.
/// Symlinks are copied as symlinks.
pub fn copy_recursive(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    warn_conflicts: bool,
) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|err| Error::IoError(format!("walk failed: {}", err)))?;
        let relative = entry.path().strip_prefix(src).map_err(|err| {
            Error::IoError(format!("failed to relativize `{}`: {}", entry.path().display(), err))
        })?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if fs::symlink_metadata(&target).is_ok() {
            if !file_type.is_dir() && warn_conflicts {
                warn!("conflict on `{}`, keeping existing file", target.display());
            }
            continue;
        }

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(|err| {
                Error::IoError(format!("failed to create `{}`: {}", target.display(), err))
            })?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target).map_err(|err| {
                Error::IoError(format!("failed to symlink `{}`: {}", target.display(), err))
            })?;
        } else {
            fs::copy(entry.path(), &target).map_err(|err| {
                Error::IoError(format!(
                    "failed to copy `{}` to `{}`: {}",
                    entry.path().display(),
                    target.display(),
                    err
                ))
            })?;
        }
    }

    Ok(())
}

/// Clone a directory tree into `dest` by hardlinking every file.
///
/// Directories are created fresh; everything else shares inodes with the
/// source tree.
pub fn link_recursive(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|err| Error::IoError(format!("walk failed: {}", err)))?;
        let relative = entry.path().strip_prefix(src).map_err(|err| {
            Error::IoError(format!("failed to relativize `{}`: {}", entry.path().display(), err))
        })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir(&target).map_err(|err| {
                Error::IoError(format!("failed to create `{}`: {}", target.display(), err))
            })?;
        } else {
            fs::hard_link(entry.path(), &target).map_err(|err| {
                Error::IoError(format!(
                    "failed to hardlink `{}` to `{}`: {}",
                    entry.path().display(),
                    target.display(),
                    err
                ))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_clean_missing_path_is_ok() {
        let tmp = TempDir::new().unwrap();
        clean(tmp.path().join("does-not-exist")).unwrap();
    }

    #[test]
    fn test_recreate_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("scratch");
        write(&dir.join("stale.txt"), "stale");

        recreate_dir(&dir).unwrap();
        assert!(dir.exists());
        assert!(!dir.join("stale.txt").exists());
    }

    #[test]
    fn test_copy_recursive_copies_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("a.txt"), "a");
        write(&src.join("sub/b.txt"), "b");
        fs::create_dir_all(&dest).unwrap();

        copy_recursive(&src, &dest, true).unwrap();
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dest.join("sub/b.txt")).unwrap(), "b");
    }

    #[test]
    fn test_copy_recursive_first_file_wins() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        let dest = tmp.path().join("dest");
        write(&first.join("tool"), "first");
        write(&second.join("tool"), "second");
        fs::create_dir_all(&dest).unwrap();

        copy_recursive(&first, &dest, false).unwrap();
        copy_recursive(&second, &dest, false).unwrap();
        assert_eq!(fs::read_to_string(dest.join("tool")).unwrap(), "first");
    }

    #[test]
    fn test_copy_recursive_preserves_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("real.txt"), "data");
        symlink("real.txt", src.join("alias.txt")).unwrap();
        fs::create_dir_all(&dest).unwrap();

        copy_recursive(&src, &dest, true).unwrap();
        let link = fs::read_link(dest.join("alias.txt")).unwrap();
        assert_eq!(link, Path::new("real.txt"));
    }

    #[test]
    fn test_link_recursive_shares_inodes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("parent");
        let dest = tmp.path().join("child");
        write(&src.join("etc/os-release"), "chariot");
        fs::create_dir_all(&dest).unwrap();

        link_recursive(&src, &dest).unwrap();
        let original = fs::metadata(src.join("etc/os-release")).unwrap();
        let linked = fs::metadata(dest.join("etc/os-release")).unwrap();
        assert_eq!(original.ino(), linked.ino());
    }
}
