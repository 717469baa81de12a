use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{Mutex, watch};

/// The subprocesses the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// The n2n edge daemon owning the tunnel interface.
    Edge,
    /// The DHCP client, run through the isolating launcher.
    Dhcp,
    /// A one-shot `dhclient -r` run on shutdown.
    Release,
}

impl Display for ProcessKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Edge => write!(f, "edge"),
            ProcessKind::Dhcp => write!(f, "dhclient"),
            ProcessKind::Release => write!(f, "dhclient-release"),
        }
    }
}

/// Everything needed to start one subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub kind: ProcessKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Receives both stdout and stderr. Output is discarded when unset.
    pub log_file: Option<PathBuf>,
}

/// A running child process.
///
/// Both methods take `&self` so one task can wait while another signals.
#[async_trait]
pub trait Child: Send + Sync + 'static {
    fn id(&self) -> Option<u32>;

    /// Sends `signal`. Signalling a child that was already reaped is a no-op.
    fn signal(&self, signal: Signal) -> io::Result<()>;

    async fn wait(&self) -> io::Result<ExitStatus>;
}

/// Starts subprocesses. Abstracted so the supervisor can run against fakes.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn Child>>;
}

/// Spawns real OS processes with tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn Child>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        match &spec.log_file {
            Some(path) => {
                let log = File::create(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        debug!(
            "spawning {}: {} {}",
            spec.kind,
            spec.program.display(),
            spec.args.join(" ")
        );
        let child = cmd.spawn()?;
        Ok(Box::new(OsChild {
            pid: child.id(),
            inner: Mutex::new(child),
            reaped: AtomicBool::new(false),
        }))
    }
}

struct OsChild {
    pid: Option<u32>,
    inner: Mutex<tokio::process::Child>,
    reaped: AtomicBool,
}

#[async_trait]
impl Child for OsChild {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        // the pid may belong to someone else once the child was reaped
        if self.reaped.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
    }

    async fn wait(&self) -> io::Result<ExitStatus> {
        let status = self.inner.lock().await.wait().await?;
        self.reaped.store(true, Ordering::Release);
        Ok(status)
    }
}

/// A supervised child: a reaper task waits for it and reports its exit.
pub struct ProcessHandle {
    kind: ProcessKind,
    attempt: u64,
    child: Arc<dyn Child>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Takes ownership of `child` and spawns its reaper.
    ///
    /// `on_exit` runs exactly once, on the reaper task, with the exit status
    /// (`None` if waiting failed).
    pub fn supervise<F>(kind: ProcessKind, attempt: u64, child: Box<dyn Child>, on_exit: F) -> Self
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        let child: Arc<dyn Child> = Arc::from(child);
        let (exited_tx, exited) = watch::channel(false);
        let reaper = child.clone();
        tokio::spawn(async move {
            let status = match reaper.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("failed to wait for {kind}: {e}");
                    None
                }
            };
            exited_tx.send_replace(true);
            on_exit(status);
        });
        Self {
            kind,
            attempt,
            child,
            exited,
        }
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// True until the reaper has collected the exit status, whatever it is.
    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    pub fn signal(&self, signal: Signal) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.child.signal(signal) {
            warn!("failed to send {signal} to {}: {e}", self.kind);
        }
    }

    /// Waits until the child has exited.
    pub async fn wait(&self) {
        let mut exited = self.exited.clone();
        // an error means the reaper is gone, which only happens after it reported
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Sends `signal`, waits up to `grace`, then kills.
    pub async fn shutdown(&self, signal: Signal, grace: Duration) {
        if !self.is_running() {
            return;
        }
        debug!("stopping {} (pid {:?}) with {signal}", self.kind, self.id());
        self.signal(signal);
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return;
        }
        warn!("{} did not exit within {grace:?}, killing it", self.kind);
        self.signal(Signal::SIGKILL);
        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            warn!("{} (pid {:?}) survived SIGKILL", self.kind, self.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            kind: ProcessKind::Edge,
            program: PathBuf::from(program),
            args: args.iter().map(|s| s.to_string()).collect(),
            log_file: None,
        }
    }

    #[tokio::test]
    async fn test_reaper_reports_exit() {
        let child = OsSpawner.spawn(&spec("/bin/sh", &["-c", "exit 3"])).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = ProcessHandle::supervise(ProcessKind::Edge, 1, child, move |status| {
            let _ = tx.send(status);
        });
        let status = rx.await.unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
        handle.wait().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let child = OsSpawner
            .spawn(&spec("/bin/sh", &["-c", "trap '' TERM; sleep 30"]))
            .unwrap();
        let handle = ProcessHandle::supervise(ProcessKind::Edge, 1, child, |_| {});
        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown(Signal::SIGTERM, Duration::from_millis(300)).await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_log_file_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec("/bin/sh", &["-c", "echo out; echo err >&2"]);
        spec.log_file = Some(dir.path().join("edge.log"));
        let child = OsSpawner.spawn(&spec).unwrap();
        child.wait().await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("edge.log")).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }
}
