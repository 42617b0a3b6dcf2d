// src/container.rs

//! Unprivileged container harness
//!
//! Executes commands inside an unshared namespace rooted at a given rootfs:
//!
//! - user + pid namespaces, with uid/gid 0 mapped onto the invoking user
//! - a mount namespace with the rootfs bind-mounted onto itself (read-only
//!   unless disabled with [`Container::rw`]), host `/etc/resolv.conf`,
//!   `/dev`, and `/sys` bound in, fresh tmpfs on `/run`, `/tmp`, and
//!   `/var/tmp`, and `proc` on `/proc`
//! - configured bind mounts composed on top, read-only where flagged
//!
//! Image-set layers share inodes with their parents through hardlink
//! clones, so the rootfs stays read-only for recipe builds; only the layer
//! cache itself drops the protection while it installs packages.
//!
//! Only the child's exit status is surfaced; stdout/stderr are captured
//! through pipes, streamed to the terminal unless quiet, and teed into a log
//! file when configured. Code past a `fork` boundary cannot propagate
//! errors, so it reports to stderr and exits 127.

use crate::error::{Error, Result};
use nix::libc::{STDERR_FILENO, STDOUT_FILENO};
use nix::mount::{mount, MsFlags};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, dup2, execvpe, fork, getegid, geteuid, pipe, read, ForkResult, Pid};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::warn;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A bind mount from a host path onto a path inside the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Mount {
        Mount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Mount {
        self.read_only = true;
        self
    }
}

/// What happens to the child's stdout/stderr.
///
/// stderr always streams to the terminal; `quiet` suppresses stdout only.
/// Both streams are teed into `log_path` when set.
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    pub quiet: bool,
    pub log_path: Option<PathBuf>,
}

/// A configured execution context for one rootfs. The rootfs itself is
/// mounted read-only unless [`Container::rw`] is called; writable paths come
/// from the configured bind mounts.
pub struct Container {
    rootfs: PathBuf,
    read_only: bool,
    cwd: PathBuf,
    mounts: Vec<Mount>,
    env: Vec<(String, String)>,
    output: OutputConfig,
}

impl Container {
    pub fn new(rootfs: impl Into<PathBuf>) -> Container {
        Container {
            rootfs: rootfs.into(),
            read_only: true,
            cwd: PathBuf::from("/root"),
            mounts: Vec::new(),
            env: Vec::new(),
            output: OutputConfig::default(),
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Container {
        self.cwd = cwd.into();
        self
    }

    /// Remount the rootfs writable. Only the layer cache needs this, while
    /// it installs packages into a freshly cloned layer.
    pub fn rw(mut self) -> Container {
        self.read_only = false;
        self
    }

    pub fn mount(mut self, mount: Mount) -> Container {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Container {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn output(mut self, output: OutputConfig) -> Container {
        self.output = output;
        self
    }

    /// Host path of the rootfs this context executes in.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Working directory inside the container.
    pub fn working_dir(&self) -> &Path {
        &self.cwd
    }

    /// Configured bind mounts, in composition order.
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Configured environment variables.
    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    /// Execute an argv vector inside the container, blocking until it
    /// exits. A nonzero exit status maps to `Error::CommandFailed`.
    pub fn exec(&self, argv: &[&str]) -> Result<()> {
        let fork_result = unsafe { fork() }
            .map_err(|err| Error::IoError(format!("fork failed: {}", err)))?;

        match fork_result {
            ForkResult::Child => stage1(self, argv),
            ForkResult::Parent { child } => {
                match waitpid(child, None)
                    .map_err(|err| Error::IoError(format!("waitpid failed: {}", err)))?
                {
                    WaitStatus::Exited(_, 0) => Ok(()),
                    WaitStatus::Exited(_, code) => Err(Error::CommandFailed(code)),
                    status => Err(Error::IoError(format!(
                        "container child failed: {:?}",
                        status
                    ))),
                }
            }
        }
    }

    /// Execute a shell command inside the container.
    pub fn exec_shell(&self, command: &str) -> Result<()> {
        self.exec(&["bash", "-c", command])
    }
}

/// Map a container-absolute path to its location under the rootfs.
fn in_rootfs(rootfs: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => rootfs.join(relative),
        Err(_) => rootfs.join(path),
    }
}

/// First forked stage: user/pid namespaces and the id mapping.
fn stage1(container: &Container, argv: &[&str]) -> ! {
    let code = match stage1_inner(container, argv) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("chariot container: {}", err);
            127
        }
    };
    exit(code);
}

fn stage1_inner(container: &Container, argv: &[&str]) -> Result<i32> {
    let euid = geteuid();
    let egid = getegid();

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID)
        .map_err(|err| Error::IoError(format!("unshare (user, pid) failed: {}", err)))?;

    fs::write("/proc/self/setgroups", "deny")?;
    fs::write("/proc/self/uid_map", format!("0 {} 1", euid))?;
    fs::write("/proc/self/gid_map", format!("0 {} 1", egid))?;

    let fork_result = unsafe { fork() }
        .map_err(|err| Error::IoError(format!("fork failed: {}", err)))?;
    match fork_result {
        ForkResult::Child => stage2(container, argv),
        ForkResult::Parent { child } => {
            match waitpid(child, None)
                .map_err(|err| Error::IoError(format!("waitpid failed: {}", err)))?
            {
                WaitStatus::Exited(_, code) => Ok(code),
                status => Err(Error::IoError(format!(
                    "container runtime failed: {:?}",
                    status
                ))),
            }
        }
    }
}

/// Second forked stage: mount namespace, filesystem composition, chroot,
/// and the final exec with stdio capture.
fn stage2(container: &Container, argv: &[&str]) -> ! {
    let code = match stage2_inner(container, argv) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("chariot container: {}", err);
            127
        }
    };
    exit(code);
}

fn stage2_inner(container: &Container, argv: &[&str]) -> Result<i32> {
    // The log file lives on the host side of the upcoming chroot, so open
    // it now.
    let log = match &container.output.log_path {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("failed to open log file `{}`: {}", path.display(), err);
                None
            }
        },
        None => None,
    };

    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|err| Error::IoError(format!("unshare (mount) failed: {}", err)))?;

    setup_rootfs(container)?;

    chroot(&container.rootfs).map_err(|err| Error::IoError(format!("chroot failed: {}", err)))?;
    chdir(&container.cwd).map_err(|err| {
        Error::IoError(format!("chdir to `{}` failed: {}", container.cwd.display(), err))
    })?;

    let (stdout_read, stdout_write) =
        pipe().map_err(|err| Error::IoError(format!("pipe failed: {}", err)))?;
    let (stderr_read, stderr_write) =
        pipe().map_err(|err| Error::IoError(format!("pipe failed: {}", err)))?;

    let fork_result = unsafe { fork() }
        .map_err(|err| Error::IoError(format!("fork failed: {}", err)))?;
    match fork_result {
        ForkResult::Child => {
            drop(stdout_read);
            drop(stderr_read);
            let status = exec_child(container, argv, stdout_write, stderr_write);
            // Only reached when exec itself failed.
            if let Err(err) = status {
                eprintln!("chariot container: {}", err);
            }
            exit(126);
        }
        ForkResult::Parent { child } => {
            drop(stdout_write);
            drop(stderr_write);
            capture_output(child, stdout_read, stderr_read, container.output.quiet, log)
        }
    }
}

fn setup_rootfs(container: &Container) -> Result<()> {
    let rootfs = &container.rootfs;
    let bind = |from: &Path, to: &Path, flags: MsFlags| -> Result<()> {
        mount(Some(from), to, None::<&str>, flags, None::<&str>).map_err(|err| {
            Error::IoError(format!(
                "failed to mount `{}` to `{}`: {}",
                from.display(),
                to.display(),
                err
            ))
        })
    };

    bind(rootfs, rootfs, MsFlags::MS_BIND)?;

    // Every mountpoint must exist before the read-only remount.
    let resolv = in_rootfs(rootfs, Path::new("/etc/resolv.conf"));
    if !resolv.exists() {
        if let Some(parent) = resolv.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&resolv)?;
    }
    for dir in ["/dev", "/sys", "/run", "/tmp", "/var/tmp", "/proc"] {
        fs::create_dir_all(in_rootfs(rootfs, Path::new(dir)))?;
    }
    for entry in &container.mounts {
        fs::create_dir_all(in_rootfs(rootfs, &entry.target))?;
    }

    let mut remount_flags =
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if container.read_only {
        remount_flags |= MsFlags::MS_RDONLY;
    }
    bind(rootfs, rootfs, remount_flags)?;

    bind(Path::new("/etc/resolv.conf"), &resolv, MsFlags::MS_BIND)?;

    for dir in ["/dev", "/sys"] {
        bind(
            Path::new(dir),
            &in_rootfs(rootfs, Path::new(dir)),
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
        )?;
    }

    for dir in ["/run", "/tmp", "/var/tmp"] {
        let target = in_rootfs(rootfs, Path::new(dir));
        mount(None::<&str>, &target, Some("tmpfs"), MsFlags::empty(), None::<&str>)
            .map_err(|err| Error::IoError(format!("tmpfs mount on `{}` failed: {}", dir, err)))?;
    }

    let proc_target = in_rootfs(rootfs, Path::new("/proc"));
    mount(None::<&str>, &proc_target, Some("proc"), MsFlags::empty(), None::<&str>)
        .map_err(|err| Error::IoError(format!("proc mount failed: {}", err)))?;

    for entry in &container.mounts {
        let target = in_rootfs(rootfs, &entry.target);
        bind(&entry.source, &target, MsFlags::MS_BIND | MsFlags::MS_REC)?;
        if entry.read_only {
            bind(
                &entry.source,
                &target,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            )?;
        }
    }

    Ok(())
}

fn exec_child(
    container: &Container,
    argv: &[&str],
    stdout_write: OwnedFd,
    stderr_write: OwnedFd,
) -> Result<()> {
    dup2(stdout_write.as_raw_fd(), STDOUT_FILENO)
        .map_err(|err| Error::IoError(format!("dup2 stdout failed: {}", err)))?;
    dup2(stderr_write.as_raw_fd(), STDERR_FILENO)
        .map_err(|err| Error::IoError(format!("dup2 stderr failed: {}", err)))?;
    drop(stdout_write);
    drop(stderr_write);

    let program = CString::new(argv[0])
        .map_err(|_| Error::IoError("argv contains NUL".to_string()))?;
    let args: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(*arg).map_err(|_| Error::IoError("argv contains NUL".to_string())))
        .collect::<Result<_>>()?;
    let env = build_env(container)?;

    execvpe(&program, &args, &env)
        .map_err(|err| Error::IoError(format!("exec `{}` failed: {}", argv[0], err)))?;
    Ok(())
}

fn build_env(container: &Container) -> Result<Vec<CString>> {
    let cwd = container.cwd.to_string_lossy().to_string();
    let mut vars: Vec<(String, String)> = vec![
        ("PATH".to_string(), DEFAULT_PATH.to_string()),
        ("HOME".to_string(), cwd),
        ("LANG".to_string(), "C".to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
    ];

    for (name, value) in &container.env {
        match vars.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value.clone(),
            None => vars.push((name.clone(), value.clone())),
        }
    }

    vars.into_iter()
        .map(|(name, value)| {
            CString::new(format!("{}={}", name, value))
                .map_err(|_| Error::IoError("environment contains NUL".to_string()))
        })
        .collect()
}

/// Pump the child's stdout/stderr until it exits, then drain the pipes.
fn capture_output(
    child: Pid,
    stdout_read: OwnedFd,
    stderr_read: OwnedFd,
    quiet: bool,
    mut log: Option<File>,
) -> Result<i32> {
    let mut buffer = [0u8; 4096];
    loop {
        let status = waitpid(child, Some(WaitPidFlag::WNOHANG))
            .map_err(|err| Error::IoError(format!("waitpid failed: {}", err)))?;

        if let WaitStatus::StillAlive = status {
            let mut fds = [
                PollFd::new(stdout_read.as_fd(), PollFlags::POLLIN),
                PollFd::new(stderr_read.as_fd(), PollFlags::POLLIN),
            ];
            let ready = poll(&mut fds, 100u8)
                .map_err(|err| Error::IoError(format!("poll failed: {}", err)))?;
            if ready == 0 {
                continue;
            }

            let stdout_ready = fds[0]
                .revents()
                .map(|flags| flags.contains(PollFlags::POLLIN))
                .unwrap_or(false);
            let stderr_ready = fds[1]
                .revents()
                .map(|flags| flags.contains(PollFlags::POLLIN))
                .unwrap_or(false);

            if stdout_ready {
                pump(&stdout_read, &mut buffer, false, quiet, &mut log);
            }
            if stderr_ready {
                pump(&stderr_read, &mut buffer, true, quiet, &mut log);
            }
            continue;
        }

        // Child exited: drain whatever is already buffered in the pipes. A
        // zero-timeout poll keeps a lingering grandchild holding the write
        // end from blocking us.
        loop {
            let mut fds = [
                PollFd::new(stdout_read.as_fd(), PollFlags::POLLIN),
                PollFd::new(stderr_read.as_fd(), PollFlags::POLLIN),
            ];
            let ready = match poll(&mut fds, 0u8) {
                Ok(ready) => ready,
                Err(_) => break,
            };
            if ready == 0 {
                break;
            }

            let mut moved = 0;
            if fds[0].revents().map(|f| f.contains(PollFlags::POLLIN)).unwrap_or(false) {
                moved += pump(&stdout_read, &mut buffer, false, quiet, &mut log);
            }
            if fds[1].revents().map(|f| f.contains(PollFlags::POLLIN)).unwrap_or(false) {
                moved += pump(&stderr_read, &mut buffer, true, quiet, &mut log);
            }
            if moved == 0 {
                break;
            }
        }

        return match status {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
            other => Err(Error::IoError(format!("unexpected wait status: {:?}", other))),
        };
    }
}

fn pump(
    fd: &OwnedFd,
    buffer: &mut [u8],
    to_stderr: bool,
    quiet: bool,
    log: &mut Option<File>,
) -> usize {
    let count = match read(fd.as_raw_fd(), buffer) {
        Ok(count) => count,
        Err(_) => return 0,
    };
    if count == 0 {
        return 0;
    }

    let data = &buffer[..count];
    if to_stderr {
        let _ = io::stderr().write_all(data);
        let _ = io::stderr().flush();
    } else if !quiet {
        let _ = io::stdout().write_all(data);
        let _ = io::stdout().flush();
    }
    if let Some(file) = log {
        let _ = file.write_all(data);
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_rootfs_strips_leading_slash() {
        let rootfs = Path::new("/cache/sets/rootfs");
        assert_eq!(
            in_rootfs(rootfs, Path::new("/chariot/build")),
            Path::new("/cache/sets/rootfs/chariot/build")
        );
        assert_eq!(
            in_rootfs(rootfs, Path::new("relative")),
            Path::new("/cache/sets/rootfs/relative")
        );
    }

    #[test]
    fn test_build_env_defaults_and_overrides() {
        let container = Container::new("/rootfs")
            .cwd("/chariot/build")
            .env("LANG", "en_US.UTF-8")
            .env("PREFIX", "/usr");
        let env = build_env(&container).unwrap();
        let entries: Vec<String> = env
            .iter()
            .map(|s| s.to_str().unwrap().to_string())
            .collect();

        assert!(entries.contains(&format!("PATH={}", DEFAULT_PATH)));
        assert!(entries.contains(&"HOME=/chariot/build".to_string()));
        assert!(entries.contains(&"LANG=en_US.UTF-8".to_string()));
        assert!(entries.contains(&"PREFIX=/usr".to_string()));
        assert!(!entries.contains(&"LANG=C".to_string()));
    }

    #[test]
    fn test_mount_builder() {
        let mount = Mount::new("/host/path", "/chariot/patches").read_only();
        assert!(mount.read_only);
        assert_eq!(mount.target, Path::new("/chariot/patches"));
    }

    #[test]
    fn test_rootfs_read_only_by_default() {
        let container = Container::new("/cache/sets/rootfs");
        assert!(container.is_read_only());
        assert!(!container.rw().is_read_only());
    }

    #[test]
    fn test_accessors_reflect_configuration() {
        let container = Container::new("/cache/sets/a/rootfs")
            .cwd("/chariot/build")
            .mount(Mount::new("/cache/deps/host", "/usr/local"))
            .env("PREFIX", "/usr");

        assert_eq!(container.rootfs(), Path::new("/cache/sets/a/rootfs"));
        assert_eq!(container.working_dir(), Path::new("/chariot/build"));
        assert_eq!(container.mounts().len(), 1);
        assert_eq!(container.mounts()[0].target, Path::new("/usr/local"));
        assert_eq!(
            container.env_vars(),
            &[("PREFIX".to_string(), "/usr".to_string())]
        );
    }
}
