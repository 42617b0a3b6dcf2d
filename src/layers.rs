// src/layers.rs

//! Image-set layer cache
//!
//! The container rootfs for a recipe is determined by its effective set of
//! image dependencies. Layers form a tree rooted at `<cache>/sets/rootfs/`:
//! each step down adds exactly one package, and the path of sorted package
//! names uniquely identifies the installed set. A new layer is
//! hardlink-cloned from its parent (sharing inodes, since a layer is a
//! near-superset of its parent) before the one additional package is
//! installed into it.
//!
//! The base layer is bootstrapped once from a pinned Arch Linux bootstrap
//! tarball; the version tag pins both the tarball and the package mirror
//! date, so two caches built from the same tag install identical packages.

use crate::cache::Cache;
use crate::container::{Container, OutputConfig};
use crate::error::{Error, Result};
use crate::fsutil;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub const DEFAULT_ROOTFS_VERSION: &str = "2024.08.01";

/// Installed into the base rootfs during bootstrap. Everything a typical
/// autotools-style build expects to find, plus the fetch tooling the stage
/// executor invokes.
pub const BASE_PACKAGES: &[&str] = &[
    "which",
    "wget",
    "curl",
    "git",
    "python",
    "make",
    "patch",
    "bison",
    "diffutils",
    "docbook-xsl",
    "flex",
    "gettext",
    "inetutils",
    "libtool",
    "libxslt",
    "m4",
    "perl",
    "texinfo",
    "w3m",
    "xmlto",
];

pub struct LayerCache<'a> {
    cache: &'a Cache,
    rootfs_version: String,
    verbose: bool,
}

impl<'a> LayerCache<'a> {
    pub fn new(cache: &'a Cache, rootfs_version: impl Into<String>, verbose: bool) -> LayerCache<'a> {
        LayerCache {
            cache,
            rootfs_version: rootfs_version.into(),
            verbose,
        }
    }

    /// The directory of the layer holding exactly `packages`, whether or
    /// not it has been materialised yet. Identical sets always map to the
    /// same path because `BTreeSet` iterates in sorted order.
    pub fn layer_dir(&self, packages: &BTreeSet<String>) -> PathBuf {
        let mut path = self.cache.sets_dir();
        for package in packages {
            path = path.join(package);
        }
        path
    }

    /// Bootstrap the base rootfs if it does not exist yet.
    pub fn ensure_rootfs(&self) -> Result<()> {
        if self.cache.rootfs_dir().exists() {
            return Ok(());
        }
        if let Err(err) = self.bootstrap() {
            if let Err(clean_err) = fsutil::clean(self.cache.rootfs_dir()) {
                warn!("failed to remove partial rootfs: {}", clean_err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn bootstrap(&self) -> Result<()> {
        info!("bootstrapping base rootfs ({})", self.rootfs_version);
        let rootfs = self.cache.rootfs_dir();
        fs::create_dir_all(&rootfs)?;

        let url = format!(
            "https://archive.archlinux.org/iso/{}/archlinux-bootstrap-x86_64.tar.zst",
            self.rootfs_version
        );
        let download = format!(
            "wget -qO- {} | tar --strip-components 1 -x --zstd -C {}",
            url,
            rootfs.display()
        );
        let status = Command::new("sh")
            .arg("-c")
            .arg(&download)
            .status()
            .map_err(|err| Error::IoError(format!("failed to run host shell: {}", err)))?;
        if !status.success() {
            return Err(Error::IoError(format!(
                "rootfs download failed (`{}`)",
                url
            )));
        }

        let mirror_date = self.rootfs_version.replace('.', "/");
        // Bootstrap is one of the two operations that writes the rootfs
        // itself.
        let container = Container::new(&rootfs).rw().output(OutputConfig {
            quiet: !self.verbose,
            log_path: None,
        });

        container.exec_shell(&format!(
            "echo 'Server = https://archive.archlinux.org/repos/{}/$repo/os/$arch' > /etc/pacman.d/mirrorlist",
            mirror_date
        ))?;
        container.exec_shell("echo 'en_US.UTF-8 UTF-8' > /etc/locale.gen")?;
        container.exec_shell("locale-gen")?;
        container.exec_shell("pacman-key --init")?;
        container.exec_shell("pacman-key --populate archlinux")?;
        container.exec_shell("pacman --noconfirm -Sy archlinux-keyring")?;
        container.exec_shell("pacman --noconfirm -S pacman pacman-mirrorlist")?;
        container.exec_shell("pacman --noconfirm -Syu")?;
        container.exec_shell(&format!("pacman --noconfirm -S {}", BASE_PACKAGES.join(" ")))?;

        info!("rootfs ready");
        Ok(())
    }

    /// Materialise the layer for `packages`, creating any missing steps
    /// along the way, and return its rootfs path.
    pub fn materialize(&self, packages: &BTreeSet<String>) -> Result<PathBuf> {
        let mut current = self.cache.sets_dir();
        for package in packages {
            let layer = current.join(package);
            if !layer.exists() {
                if let Err(err) = self.install_layer(&current, &layer, package) {
                    // Remove the partial layer so a re-run sees a clean miss.
                    if let Err(clean_err) = fsutil::clean(&layer) {
                        warn!(
                            "failed to remove partial layer `{}`: {}",
                            layer.display(),
                            clean_err
                        );
                    }
                    return Err(err);
                }
            }
            current = layer;
        }
        Ok(current.join("rootfs"))
    }

    fn install_layer(&self, parent: &Path, layer: &Path, package: &str) -> Result<()> {
        info!("creating image-set layer for `{}`", package);
        let layer_rootfs = layer.join("rootfs");
        fs::create_dir_all(&layer_rootfs)?;
        fsutil::link_recursive(parent.join("rootfs"), &layer_rootfs)?;

        // The package install mutates the freshly cloned layer, so this
        // container runs with the rootfs writable.
        Container::new(&layer_rootfs)
            .rw()
            .output(OutputConfig {
                quiet: !self.verbose,
                log_path: None,
            })
            .exec(&["pacman", "--noconfirm", "-S", package])
            .map_err(|_| Error::LayerInstallFailed(package.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(packages: &[&str]) -> BTreeSet<String> {
        packages.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_layer_dir_is_canonical() {
        let tmp = TempDir::new().unwrap();
        let cache = Cache::open(tmp.path(), false).unwrap();
        let layers = LayerCache::new(&cache, DEFAULT_ROOTFS_VERSION, false);

        // Same multiset in any declaration order resolves to one path.
        assert_eq!(
            layers.layer_dir(&set(&["b", "a", "c"])),
            layers.layer_dir(&set(&["c", "b", "a"]))
        );
        assert_eq!(
            layers.layer_dir(&set(&["a", "b"])),
            tmp.path().join("sets/a/b")
        );
    }

    #[test]
    fn test_layer_dir_nests_supersets() {
        let tmp = TempDir::new().unwrap();
        let cache = Cache::open(tmp.path(), false).unwrap();
        let layers = LayerCache::new(&cache, DEFAULT_ROOTFS_VERSION, false);

        let smaller = layers.layer_dir(&set(&["a", "b"]));
        let larger = layers.layer_dir(&set(&["a", "b", "c"]));
        assert_eq!(larger.parent(), Some(smaller.as_path()));
    }

    #[test]
    fn test_materialize_empty_set_is_base_rootfs() {
        let tmp = TempDir::new().unwrap();
        let cache = Cache::open(tmp.path(), false).unwrap();
        let layers = LayerCache::new(&cache, DEFAULT_ROOTFS_VERSION, false);

        let rootfs = layers.materialize(&BTreeSet::new()).unwrap();
        assert_eq!(rootfs, cache.rootfs_dir());
    }
}
