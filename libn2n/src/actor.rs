//! The supervisor task. Owns every process handle and all connection state;
//! the public [`Supervisor`](crate::Supervisor) only talks to it over channels.

use std::fs;
use std::process::ExitStatus;
use std::sync::Arc;

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use libisolate::dhclient::{local_hostname, write_config};

use crate::config::SupervisorConfig;
use crate::error::Failure;
use crate::lease::Lease;
use crate::process::{CommandSpec, ProcessHandle, ProcessKind};
use crate::supervisor::{Backends, LinkObserver, Phase, Snapshot};
use crate::watcher::{AddressWatcher, WatchOutcome};

pub(crate) enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Disconnect,
}

/// Completions posted by reapers and watchers, tagged with the attempt that
/// produced them.
#[derive(Debug)]
enum Event {
    Exited {
        attempt: u64,
        kind: ProcessKind,
        status: Option<ExitStatus>,
    },
    Watched {
        attempt: u64,
        outcome: WatchOutcome,
    },
}

pub(crate) struct Actor {
    cfg: SupervisorConfig,
    backends: Backends,
    observer: Arc<dyn LinkObserver>,
    state: watch::Sender<Snapshot>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    phase: Phase,
    attempt: u64,
    tunnel: Option<ProcessHandle>,
    dhcp: Option<ProcessHandle>,
    watcher: Option<CancellationToken>,
    lease: Option<Lease>,
    /// `on_up` accepted the current connection.
    announced: bool,
    /// Next interface poll or end of backoff.
    deadline: Option<Instant>,
    interface_polls: u32,
}

impl Actor {
    pub(crate) fn new(
        cfg: SupervisorConfig,
        backends: Backends,
        observer: Arc<dyn LinkObserver>,
        state: watch::Sender<Snapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            backends,
            observer,
            state,
            events_tx,
            events_rx,
            phase: Phase::Idle,
            attempt: 0,
            tunnel: None,
            dhcp: None,
            watcher: None,
            lease: None,
            announced: false,
            deadline: None,
            interface_polls: 0,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Start) => self.start().await,
                    Some(Command::Disconnect) => self.disconnect(),
                    Some(Command::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => {
                        debug!("supervisor handle dropped, shutting down");
                        self.stop().await;
                        return;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                _ = sleep_until(deadline) => {
                    self.deadline = None;
                    self.on_timer().await;
                }
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("{}: {} -> {}", self.cfg.interface, self.phase, phase);
        }
        self.phase = phase;
        self.state.send_replace(Snapshot {
            phase,
            lease: self.lease,
        });
    }

    async fn start(&mut self) {
        if self.phase != Phase::Idle {
            debug!("start ignored, supervisor is {}", self.phase);
            return;
        }
        self.begin_attempt().await;
    }

    fn disconnect(&mut self) {
        match &self.tunnel {
            Some(tunnel) => {
                info!("disconnecting {}", self.cfg.interface);
                tunnel.signal(Signal::SIGTERM);
            }
            None => debug!("disconnect ignored, no tunnel running"),
        }
    }

    async fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.interface_polls = 0;
        info!(
            "connecting {} to {} (attempt {})",
            self.cfg.interface, self.cfg.edge.supernode, self.attempt
        );
        self.set_phase(Phase::Starting);

        if let Err(e) = fs::create_dir_all(&self.cfg.work_dir) {
            let reason = format!("cannot create {}: {e}", self.cfg.work_dir.display());
            return self
                .fail(Failure::SpawnFailed {
                    kind: ProcessKind::Edge,
                    reason,
                })
                .await;
        }

        let spec = CommandSpec {
            kind: ProcessKind::Edge,
            program: self.cfg.edge.binary.clone(),
            args: self.cfg.edge.args(&self.cfg.interface),
            log_file: Some(self.cfg.edge_log()),
        };
        match self.spawn(spec) {
            Ok(handle) => self.tunnel = Some(handle),
            Err(failure) => return self.fail(failure).await,
        }
        self.set_phase(Phase::WaitingInterface);
        self.deadline = Some(Instant::now());
    }

    async fn on_timer(&mut self) {
        match self.phase {
            Phase::WaitingInterface => self.poll_interface().await,
            Phase::BackoffWait => self.begin_attempt().await,
            phase => debug!("timer fired while {phase}"),
        }
    }

    async fn poll_interface(&mut self) {
        let exists = match self.backends.probe.interface_exists(&self.cfg.interface).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("failed to look up {}: {e:#}", self.cfg.interface);
                false
            }
        };
        if exists {
            info!("interface {} is up", self.cfg.interface);
            return self.launch_dhcp().await;
        }

        // one immediate check plus `interface_polls` more, one per interval
        self.interface_polls += 1;
        if self.interface_polls > self.cfg.interface_polls {
            return self
                .fail(Failure::InterfaceTimeout {
                    interface: self.cfg.interface.clone(),
                    polls: self.interface_polls,
                })
                .await;
        }
        self.deadline = Some(Instant::now() + self.cfg.poll_interval);
    }

    async fn launch_dhcp(&mut self) {
        if let Err(e) = write_config(&self.cfg.dhclient_config(), &local_hostname()) {
            return self
                .fail(Failure::SpawnFailed {
                    kind: ProcessKind::Dhcp,
                    reason: format!("cannot write dhclient config: {e}"),
                })
                .await;
        }
        let spec = CommandSpec {
            kind: ProcessKind::Dhcp,
            program: self.cfg.helper_program.clone(),
            args: self.cfg.helper_args("dhclient"),
            log_file: Some(self.cfg.work_dir.join("dhclient-helper.log")),
        };
        match self.spawn(spec) {
            Ok(handle) => self.dhcp = Some(handle),
            Err(failure) => return self.fail(failure).await,
        }
        self.set_phase(Phase::WaitingAddress);

        let token = CancellationToken::new();
        let events = self.events_tx.clone();
        let attempt = self.attempt;
        AddressWatcher::new(
            self.backends.probe.clone(),
            self.cfg.interface.clone(),
            self.cfg.watch_config(),
        )
        .spawn(token.clone(), move |outcome| {
            let _ = events.send(Event::Watched { attempt, outcome });
        });
        self.watcher = Some(token);
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Watched { attempt, outcome } => {
                if attempt != self.attempt || self.watcher.take().is_none() {
                    debug!("dropping stale watcher result from attempt {attempt}");
                    return;
                }
                match outcome {
                    WatchOutcome::Acquired(network) => self.connected(Lease::from_network(network)).await,
                    WatchOutcome::TimedOut { polls } => {
                        self.fail(Failure::AddressTimeout {
                            interface: self.cfg.interface.clone(),
                            polls,
                        })
                        .await
                    }
                }
            }
            Event::Exited {
                attempt,
                kind,
                status,
            } => {
                let current = match kind {
                    ProcessKind::Edge => self.tunnel.as_ref(),
                    ProcessKind::Dhcp => self.dhcp.as_ref(),
                    ProcessKind::Release => None,
                };
                if !current.is_some_and(|h| h.attempt() == attempt) {
                    debug!("ignoring exit of {kind} from attempt {attempt}");
                    return;
                }
                let status = status.map_or_else(|| "status unknown".to_string(), |s| s.to_string());
                self.fail(Failure::ProcessExitedEarly { kind, status }).await;
            }
        }
    }

    async fn connected(&mut self, lease: Lease) {
        self.lease = Some(lease);
        self.set_phase(Phase::Connected);
        info!(
            "{} connected: local {} peer {} netmask {}",
            self.cfg.interface, lease.local, lease.peer, lease.netmask
        );
        match self.observer.on_up() {
            Ok(()) => self.announced = true,
            Err(e) => self.fail(Failure::UpCallbackRejected(format!("{e:#}"))).await,
        }
    }

    /// Ends the current attempt and schedules the next one.
    ///
    /// The actor loop is parked until teardown finishes; commands and
    /// attempt events queue in their channels meanwhile.
    async fn fail(&mut self, failure: Failure) {
        error!("{} attempt {} failed: {failure}", self.cfg.interface, self.attempt);
        self.lease = None;
        self.set_phase(Phase::Stopping);
        self.teardown(false).await;
        if std::mem::take(&mut self.announced) {
            self.observer.on_down();
        }
        info!("retrying {} in {:?}", self.cfg.interface, self.cfg.backoff);
        self.deadline = Some(Instant::now() + self.cfg.backoff);
        self.set_phase(Phase::BackoffWait);
    }

    /// Tears down with an optional lease release and goes idle. Like `fail`,
    /// this holds the actor loop for the whole teardown.
    async fn stop(&mut self) {
        self.deadline = None;
        if self.phase == Phase::Idle {
            return;
        }
        info!("stopping {}", self.cfg.interface);
        self.lease = None;
        self.set_phase(Phase::Stopping);
        self.teardown(self.cfg.release_on_stop).await;
        if std::mem::take(&mut self.announced) {
            self.observer.on_down();
        }
        self.set_phase(Phase::Idle);
    }

    /// Stops the watcher, then the DHCP client, then the tunnel. Safe to call
    /// with nothing running.
    ///
    /// Awaited inline, so it can take up to three `stop_grace` periods plus
    /// `release_timeout` before the loop polls its channels again.
    async fn teardown(&mut self, release: bool) {
        if let Some(token) = self.watcher.take() {
            token.cancel();
        }
        let had_dhcp = match self.dhcp.take() {
            Some(dhcp) => {
                dhcp.shutdown(Signal::SIGINT, self.cfg.stop_grace).await;
                true
            }
            None => false,
        };
        if let Some(tunnel) = self.tunnel.take() {
            if release && had_dhcp && tunnel.is_running() {
                self.release_lease().await;
            }
            tunnel.shutdown(Signal::SIGTERM, self.cfg.stop_grace).await;
        }
    }

    /// Runs `dhclient -r` through the helper while the tunnel can still carry
    /// the release.
    async fn release_lease(&mut self) {
        let spec = CommandSpec {
            kind: ProcessKind::Release,
            program: self.cfg.helper_program.clone(),
            args: self.cfg.helper_args("dhclient-release"),
            log_file: Some(self.cfg.work_dir.join("dhclient-release-helper.log")),
        };
        let handle = match self.spawn(spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("skipping lease release: {e}");
                return;
            }
        };
        if tokio::time::timeout(self.cfg.release_timeout, handle.wait())
            .await
            .is_err()
        {
            warn!(
                "lease release on {} timed out after {:?}",
                self.cfg.interface, self.cfg.release_timeout
            );
            handle.shutdown(Signal::SIGTERM, self.cfg.stop_grace).await;
        }
    }

    fn spawn(&self, spec: CommandSpec) -> Result<ProcessHandle, Failure> {
        let kind = spec.kind;
        let child = self
            .backends
            .spawner
            .spawn(&spec)
            .map_err(|e| Failure::SpawnFailed {
                kind,
                reason: format!("{}: {e}", spec.program.display()),
            })?;
        let attempt = self.attempt;
        let events = self.events_tx.clone();
        Ok(ProcessHandle::supervise(kind, attempt, child, move |status| {
            let _ = events.send(Event::Exited {
                attempt,
                kind,
                status,
            });
        }))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
