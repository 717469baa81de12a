use std::fmt::{Display, Formatter};
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use once_cell::sync::OnceCell;

use crate::error::IsolateError;

static CAPABILITY: OnceCell<Capability> = OnceCell::new();

/// Whether this process can create private mount namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Available,
    /// Carries the errno the first namespace operation would fail with.
    Unavailable(Errno),
}

impl Capability {
    pub fn check(&self) -> Result<(), IsolateError> {
        match self {
            Capability::Available => Ok(()),
            Capability::Unavailable(errno) => Err(IsolateError::NamespaceIsolationFailed {
                op: "probe",
                source: *errno,
            }),
        }
    }
}

/// Returns the process-wide namespace capability, probing it on first use.
///
/// The answer cannot change while the process runs, so it is computed once.
pub fn capability() -> &'static Capability {
    CAPABILITY.get_or_init(probe)
}

fn probe() -> Capability {
    if !Path::new("/proc/self/ns/mnt").exists() {
        warn!("kernel does not expose /proc/self/ns/mnt");
        return Capability::Unavailable(Errno::ENOSYS);
    }
    if !nix::unistd::geteuid().is_root() {
        warn!("creating a mount namespace requires root");
        return Capability::Unavailable(Errno::EPERM);
    }
    debug!("mount namespace isolation is available");
    Capability::Available
}

/// A scoped OS isolation primitive.
///
/// `acquire` makes `source` visible at `target` for the current thread only;
/// dropping the returned session undoes everything `acquire` did.
pub trait Isolation {
    type Session;

    fn acquire(&self, source: &Path, target: &Path) -> Result<Self::Session, IsolateError>;
}

/// Isolation through `unshare(CLONE_NEWNS)` and a bind mount.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountNamespaceIsolation;

impl Isolation for MountNamespaceIsolation {
    type Session = IsolationSession;

    fn acquire(&self, source: &Path, target: &Path) -> Result<IsolationSession, IsolateError> {
        capability().check()?;
        IsolationSession::enter(source, target)
    }
}

/// A live bind mount inside a private mount namespace.
///
/// Field order matters: the bind mount is released before the namespace.
#[derive(Debug)]
pub struct IsolationSession {
    _bind: BindMount,
    _namespace: PrivateMountNamespace,
}

impl IsolationSession {
    pub fn enter(source: &Path, target: &Path) -> Result<Self, IsolateError> {
        let namespace = PrivateMountNamespace::enter()?;
        let bind = BindMount::new(source, target)?;
        Ok(Self {
            _bind: bind,
            _namespace: namespace,
        })
    }
}

/// The calling thread's private mount namespace.
///
/// Holds the thread's original namespace and switches back to it on drop.
/// Mount namespaces are per-thread once `CLONE_NEWNS` is unshared, so the
/// guard must be dropped on the thread that created it.
#[derive(Debug)]
pub struct PrivateMountNamespace {
    original: File,
}

impl PrivateMountNamespace {
    pub fn enter() -> Result<Self, IsolateError> {
        let ns_path = format!(
            "/proc/{}/task/{}/ns/mnt",
            std::process::id(),
            nix::unistd::gettid()
        );
        let original = File::open(&ns_path)?;

        nix::sched::unshare(CloneFlags::CLONE_NEWNS).map_err(IsolateError::namespace("unshare"))?;
        // From here on the guard restores the original namespace even if
        // the propagation change below fails.
        let guard = Self { original };

        // Same as util-linux unshare: stop mount events from propagating
        // back into the parent namespace.
        nix::mount::mount::<str, str, str, str>(
            Some("none"),
            "/",
            None,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None,
        )
        .map_err(IsolateError::namespace("make-rprivate"))?;

        debug!("entered private mount namespace, saved {guard}");
        Ok(guard)
    }
}

impl Drop for PrivateMountNamespace {
    fn drop(&mut self) {
        if let Err(e) = nix::sched::setns(self.original.as_fd(), CloneFlags::CLONE_NEWNS) {
            warn!("failed to restore original mount namespace: {e}");
        }
    }
}

impl Display for PrivateMountNamespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mntns(fd {})", self.original.as_raw_fd())
    }
}

/// A bind mount that is detached on drop.
#[derive(Debug)]
pub struct BindMount {
    target: PathBuf,
}

impl BindMount {
    pub fn new(source: &Path, target: &Path) -> Result<Self, IsolateError> {
        nix::mount::mount::<Path, Path, str, str>(
            Some(source),
            target,
            None,
            MsFlags::MS_BIND,
            None,
        )
        .map_err(IsolateError::namespace("bind-mount"))?;
        debug!("bind mounted {} over {}", source.display(), target.display());
        Ok(Self {
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for BindMount {
    fn drop(&mut self) {
        if let Err(e) = nix::mount::umount2(&self.target, MntFlags::MNT_DETACH) {
            warn!("failed to unmount {}: {e}", self.target.display());
        }
    }
}
