use std::fs::{self, File};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpid, getppid};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::signal::unix::{SignalKind, signal};

use crate::DHCP_HOOKS_PATH;
use crate::error::IsolateError;
use crate::hooks::HooksDir;
use crate::ns::{Isolation, MountNamespaceIsolation};

pub const DHCLIENT_BINARY: &str = "/sbin/dhclient";
pub const CONFIG_FILE: &str = "dhclient.conf";
pub const PID_FILE: &str = "dhclient.pid";
pub const LEASE_FILE: &str = "dhclient.leases";

/// How long dhclient gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// Renders the dhclient configuration used for the tunnel.
///
/// The option set mirrors what NetworkManager asks for. `supersede routers`
/// keeps the tunnel from installing a default route.
pub fn render_config(hostname: &str) -> String {
    format!(
        "send host-name \"{hostname}\";\n\
         \n\
         option rfc3442-classless-static-routes code 121 = array of unsigned integer 8;\n\
         option wpad code 252 = string;\n\
         \n\
         also request rfc3442-classless-static-routes;\n\
         also request static-routes;\n\
         also request wpad;\n\
         also request ntp-servers;\n\
         \n\
         supersede routers 0.0.0.0;\n"
    )
}

pub fn write_config(path: &Path, hostname: &str) -> io::Result<()> {
    debug!("writing dhclient config to {}", path.display());
    fs::write(path, render_config(hostname))
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// What the launched dhclient is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Acquire and hold a lease in the foreground.
    Lease,
    /// Release the lease recorded in the lease file and exit.
    Release,
}

impl Mode {
    fn flag(self) -> &'static str {
        match self {
            Mode::Lease => "-d",
            Mode::Release => "-r",
        }
    }

    fn hooks_prefix(self) -> &'static str {
        match self {
            Mode::Lease => "etc-dhcp",
            Mode::Release => "etc-dhcp-release",
        }
    }

    fn output_name(self) -> &'static str {
        match self {
            Mode::Lease => "dhclient.out",
            Mode::Release => "dhclient-release.out",
        }
    }
}

/// Runs dhclient for one interface with a private hooks directory.
///
/// Everything the launcher creates lives in `work_dir`. The isolation
/// session, the hooks directory and a stale PID file are cleaned up on every
/// exit path, including an interrupt while dhclient is running.
#[derive(Debug, Clone)]
pub struct Launcher<I = MountNamespaceIsolation> {
    pub dhclient: PathBuf,
    pub work_dir: PathBuf,
    pub config_file: PathBuf,
    pub interface: String,
    pub hooks_source: Option<PathBuf>,
    pub hooks_target: PathBuf,
    pub grace: Duration,
    isolation: I,
}

impl Launcher {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            dhclient: PathBuf::from(DHCLIENT_BINARY),
            work_dir: work_dir.into(),
            config_file: config_file.into(),
            interface: interface.into(),
            hooks_source: None,
            hooks_target: PathBuf::from(DHCP_HOOKS_PATH),
            grace: DEFAULT_GRACE,
            isolation: MountNamespaceIsolation,
        }
    }
}

impl<I: Isolation> Launcher<I> {
    pub fn with_isolation<J: Isolation>(self, isolation: J) -> Launcher<J> {
        Launcher {
            dhclient: self.dhclient,
            work_dir: self.work_dir,
            config_file: self.config_file,
            interface: self.interface,
            hooks_source: self.hooks_source,
            hooks_target: self.hooks_target,
            grace: self.grace,
            isolation,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.work_dir.join(PID_FILE)
    }

    pub fn lease_file(&self) -> PathBuf {
        self.work_dir.join(LEASE_FILE)
    }

    pub fn output_file(&self, mode: Mode) -> PathBuf {
        self.work_dir.join(mode.output_name())
    }

    pub fn args(&self, mode: Mode) -> Vec<String> {
        vec![
            mode.flag().to_string(),
            "-pf".to_string(),
            self.pid_file().display().to_string(),
            "-cf".to_string(),
            self.config_file.display().to_string(),
            "-lf".to_string(),
            self.lease_file().display().to_string(),
            self.interface.clone(),
        ]
    }

    /// Runs dhclient until it exits or the process receives SIGINT/SIGTERM.
    ///
    /// The signal listeners are installed before anything is created, so an
    /// early signal still ends in a full cleanup.
    pub fn run(&self, mode: Mode) -> Result<ExitStatus, IsolateError> {
        let runtime = build_runtime()?;
        let interrupt = {
            let _guard = runtime.enter();
            shutdown_signal()?
        };
        self.run_on(&runtime, mode, interrupt)
    }

    /// Runs dhclient until it exits or the future returned by `interrupt`
    /// completes, in which case dhclient is terminated.
    ///
    /// `interrupt` is called inside the launcher's runtime before any setup
    /// happens. Must be called from a thread without a tokio runtime: the
    /// isolation is thread-scoped, so dhclient is spawned from a runtime
    /// driven on the calling thread.
    pub fn run_until<F, Fut>(&self, mode: Mode, interrupt: F) -> Result<ExitStatus, IsolateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let runtime = build_runtime()?;
        let interrupt = {
            let _guard = runtime.enter();
            interrupt()
        };
        self.run_on(&runtime, mode, interrupt)
    }

    fn run_on<Fut>(&self, runtime: &Runtime, mode: Mode, interrupt: Fut) -> Result<ExitStatus, IsolateError>
    where
        Fut: Future<Output = ()>,
    {
        let hooks = match mode {
            Mode::Lease => {
                HooksDir::with_scripts(&self.work_dir, mode.hooks_prefix(), self.hooks_source.as_deref())?
            }
            Mode::Release => HooksDir::empty(&self.work_dir, mode.hooks_prefix())?,
        };

        let result = {
            let _session = self.isolation.acquire(hooks.path(), &self.hooks_target)?;
            File::create(self.output_file(mode))
                .map_err(IsolateError::from)
                .and_then(|output| runtime.block_on(self.supervise(mode, output, interrupt)))
        };

        if mode == Mode::Lease {
            remove_stale(&self.pid_file());
        }
        if let Err(e) = hooks.close() {
            warn!("failed to remove hooks directory: {e}");
        }
        result
    }

    async fn supervise<Fut>(
        &self,
        mode: Mode,
        output: File,
        interrupt: Fut,
    ) -> Result<ExitStatus, IsolateError>
    where
        Fut: Future<Output = ()>,
    {
        let args = self.args(mode);
        debug!("executing {} {}", self.dhclient.display(), args.join(" "));
        let launcher = getpid();
        let mut cmd = Command::new(&self.dhclient);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(output.try_clone()?)
            .stderr(output)
            .kill_on_drop(true);
        // SAFETY: the closure only makes async-signal-safe syscalls and does
        // not allocate.
        unsafe {
            cmd.pre_exec(move || {
                // dhclient must not outlive the launcher, even one killed
                // before it could clean up
                set_pdeathsig(Signal::SIGKILL)?;
                if getppid() != launcher {
                    return Err(io::Error::from(Errno::ESRCH));
                }
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(|source| IsolateError::Spawn {
            program: self.dhclient.clone(),
            source,
        })?;
        info!(
            "dhclient started on {} (pid {:?}, mode {mode:?})",
            self.interface,
            child.id()
        );

        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = interrupt => None,
        };
        match exited {
            Some(status) => {
                info!("dhclient on {} exited with {status}", self.interface);
                Ok(status)
            }
            None => {
                info!("interrupted, stopping dhclient on {}", self.interface);
                terminate(&mut child, self.grace).await
            }
        }
    }
}

fn build_runtime() -> Result<Runtime, IsolateError> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus, IsolateError> {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("failed to send SIGTERM to dhclient: {e}");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!("dhclient ignored SIGTERM for {grace:?}, killing it");
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

/// Registers SIGINT and SIGTERM listeners right away and returns a future
/// that completes on the first of them. Needs a runtime context.
fn shutdown_signal() -> Result<impl Future<Output = ()>, IsolateError> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => debug!("received SIGINT"),
            _ = sigterm.recv() => debug!("received SIGTERM"),
        }
    })
}

fn remove_stale(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {e}", path.display()),
    }
}
