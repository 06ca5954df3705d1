//! Network namespace files
//!
//! Namespaces are kept alive by bind mounts under a shared namespace directory
//! (`/var/run/netns` by default, the iproute2 convention). Every file this
//! instance owns is named `<prefix><name>`.
//!
//! Namespace membership belongs to the calling thread: [`NamespaceDir::open`]
//! with `create` leaves the calling thread inside the new namespace, and
//! [`enter`] switches the calling thread only.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::Mode;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

/// Namespace of the init process
pub const DEFAULT_NAMESPACE: &str = "/proc/1/ns/net";

/// Namespace of the calling thread
const THREAD_NAMESPACE: &str = "/proc/thread-self/ns/net";

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Failed to create namespace directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to mount {path}: {errno}")]
    Mount { path: PathBuf, errno: Errno },

    #[error("Failed to create namespace file {path}: {errno}")]
    CreateFile { path: PathBuf, errno: Errno },

    #[error("Namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Namespace '{0}' not found")]
    NotFound(String),

    #[error("Failed to open namespace {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create network namespace: {0}")]
    Unshare(Errno),

    #[error("Failed to enter namespace: {0}")]
    SetNs(Errno),

    #[error("Failed to delete namespace {path}: {source}")]
    Delete {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to list namespaces in {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The directory holding this instance's namespace files
#[derive(Debug, Clone)]
pub struct NamespaceDir {
    dir: PathBuf,
    prefix: String,
    mounted: bool,
}

impl NamespaceDir {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            mounted: false,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    /// Make the directory a shared mount so that namespace mounts propagate
    /// and are released as soon as they are unmounted.
    fn ensure_mounted(&mut self) -> Result<(), NetNsError> {
        if self.mounted {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|source| NetNsError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let make_shared = || {
            mount(
                Some("none"),
                &self.dir,
                None::<&str>,
                MsFlags::MS_SHARED | MsFlags::MS_REC,
                None::<&str>,
            )
        };
        match make_shared() {
            Ok(()) => {}
            Err(Errno::EINVAL) => {
                // Not a mount point yet; bind it onto itself first
                mount(
                    Some(&self.dir),
                    &self.dir,
                    Some("none"),
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(|errno| NetNsError::Mount {
                    path: self.dir.clone(),
                    errno,
                })?;
                make_shared().map_err(|errno| NetNsError::Mount {
                    path: self.dir.clone(),
                    errno,
                })?;
            }
            Err(errno) => {
                return Err(NetNsError::Mount {
                    path: self.dir.clone(),
                    errno,
                })
            }
        }
        self.mounted = true;
        Ok(())
    }

    /// Open the namespace `name`, creating it if allowed.
    ///
    /// With `exclusive`, an existing namespace is an error. A created namespace
    /// becomes the calling thread's active namespace.
    pub fn open(&mut self, name: &str, create: bool, exclusive: bool) -> Result<OwnedFd, NetNsError> {
        let path = self.path_of(name);
        if path.exists() {
            if exclusive {
                return Err(NetNsError::AlreadyExists(name.to_string()));
            }
            return open_file(&path);
        }
        if !create {
            return Err(NetNsError::NotFound(name.to_string()));
        }

        self.ensure_mounted()?;
        let fd = nix::fcntl::open(
            &path,
            OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| NetNsError::CreateFile {
            path: path.clone(),
            errno,
        })?;
        let _ = nix::unistd::close(fd);

        let created = unshare(CloneFlags::CLONE_NEWNET)
            .map_err(NetNsError::Unshare)
            .and_then(|()| {
                mount(
                    Some(THREAD_NAMESPACE),
                    &path,
                    Some("none"),
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|errno| NetNsError::Mount {
                    path: path.clone(),
                    errno,
                })
            });
        if let Err(e) = created {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        debug!("Created namespace {}", path.display());
        open_file(&path)
    }

    /// Lazily unmount and unlink a namespace. Processes still inside it keep it
    /// alive until they exit.
    pub fn delete(&self, name: &str) -> Result<(), NetNsError> {
        let path = self.path_of(name);
        match umount2(&path, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(errno) => warn!("Failed to unmount {}: {}", path.display(), errno),
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted namespace {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(NetNsError::Delete { path, source }),
        }
    }

    /// Names (without the prefix) of every namespace carrying our prefix
    pub fn enumerate(&self) -> Result<Vec<String>, NetNsError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(NetNsError::ReadDir {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|file| file.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn open_file(path: &Path) -> Result<OwnedFd, NetNsError> {
    File::open(path)
        .map(OwnedFd::from)
        .map_err(|source| NetNsError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Open the init process's namespace
pub fn open_default() -> Result<OwnedFd, NetNsError> {
    open_file(Path::new(DEFAULT_NAMESPACE))
}

/// Move the calling thread into the namespace behind `fd`
pub fn enter(fd: BorrowedFd<'_>) -> Result<(), NetNsError> {
    setns(fd, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)
}

/// Move the calling thread into the init process's namespace
pub fn enter_default() -> Result<(), NetNsError> {
    let fd = open_default()?;
    enter(fd.as_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_carry_prefix() {
        let dir = NamespaceDir::new("/var/run/netns", "nm-");
        assert_eq!(dir.path_of("12"), PathBuf::from("/var/run/netns/nm-12"));
        assert_eq!(dir.path_of("root"), PathBuf::from("/var/run/netns/nm-root"));
    }

    #[test]
    fn test_enumerate_filters_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["nm-root", "nm-0", "nm-17", "other-3", "nmx-1"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let dir = NamespaceDir::new(tmp.path(), "nm-");
        assert_eq!(dir.enumerate().unwrap(), vec!["0", "17", "root"]);

        let missing = NamespaceDir::new(tmp.path().join("missing"), "nm-");
        assert!(missing.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_delete_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("nm-4"), b"").unwrap();
        let dir = NamespaceDir::new(tmp.path(), "nm-");
        dir.delete("4").unwrap();
        assert!(!dir.exists("4"));
        dir.delete("4").unwrap();
    }

    #[test]
    fn test_open_missing_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = NamespaceDir::new(tmp.path(), "nm-");
        assert!(matches!(dir.open("9", false, false), Err(NetNsError::NotFound(_))));
    }

    #[cfg(feature = "sudo-tests")]
    #[test]
    fn test_create_enter_delete() {
        let handle = std::thread::spawn(|| {
            let mut dir = NamespaceDir::new(DEFAULT_NETNS_DIR, "nmtest-");
            let fd = dir.open("a", true, true).unwrap();
            assert!(matches!(dir.open("a", true, true), Err(NetNsError::AlreadyExists(_))));
            enter(fd.as_fd()).unwrap();
            enter_default().unwrap();
            dir.delete("a").unwrap();
            assert!(!dir.exists("a"));
        });
        handle.join().unwrap();
    }
}
