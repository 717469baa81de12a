use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::{Actor, Command};
use crate::config::SupervisorConfig;
use crate::lease::Lease;
use crate::netif::{NetProbe, NetlinkProbe};
use crate::process::{OsSpawner, Spawner};

/// Receives connectivity transitions.
///
/// Both callbacks run on the supervisor task and should return quickly.
pub trait LinkObserver: Send + Sync + 'static {
    /// The tunnel has a stable address. Returning an error rejects the
    /// connection: it is torn down and retried, and `on_down` is not called.
    fn on_up(&self) -> anyhow::Result<()>;

    /// A connection previously accepted by `on_up` is gone.
    fn on_down(&self);
}

/// The OS facilities the supervisor drives.
#[derive(Clone)]
pub struct Backends {
    pub spawner: Arc<dyn Spawner>,
    pub probe: Arc<dyn NetProbe>,
}

impl Backends {
    /// Real processes and an rtnetlink probe. Needs a tokio runtime.
    pub fn os() -> anyhow::Result<Self> {
        Ok(Self {
            spawner: Arc::new(OsSpawner),
            probe: Arc::new(NetlinkProbe::new()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    WaitingInterface,
    WaitingAddress,
    Connected,
    Stopping,
    BackoffWait,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::WaitingInterface => "waiting for interface",
            Phase::WaitingAddress => "waiting for address",
            Phase::Connected => "connected",
            Phase::Stopping => "stopping",
            Phase::BackoffWait => "backing off",
        };
        f.write_str(s)
    }
}

/// What the supervisor task last published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: Phase,
    pub lease: Option<Lease>,
}

impl Snapshot {
    pub(crate) fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            lease: None,
        }
    }
}

/// Handle to a running connection supervisor.
///
/// All state lives on a background task; the handle only sends commands and
/// reads the last published [`Snapshot`]. Dropping the handle stops the
/// supervisor and tears down its processes.
pub struct Supervisor {
    interface: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Snapshot>,
}

impl Supervisor {
    /// Spawns the supervisor task in the idle phase. Must be called inside a
    /// tokio runtime.
    pub fn new(
        cfg: SupervisorConfig,
        backends: Backends,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        let interface = cfg.interface.clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(Snapshot::idle());
        let actor = Actor::new(cfg, backends, observer, state_tx);
        tokio::spawn(actor.run(rx));
        Self {
            interface,
            commands,
            state,
        }
    }

    /// Begins connecting unless already running. Failures are only logged
    /// and retried.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Tears everything down and returns once the supervisor is idle.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Asks the edge process to exit. The supervisor notices and reconnects
    /// after the backoff interval.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.state.borrow()
    }

    /// A receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().lease.is_some()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.state.borrow().lease.map(|l| l.local)
    }

    pub fn remote_ip(&self) -> Option<Ipv4Addr> {
        self.state.borrow().lease.map(|l| l.peer)
    }

    pub fn netmask(&self) -> Option<Ipv4Addr> {
        self.state.borrow().lease.map(|l| l.netmask)
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// `(network, netmask)` pairs routed over the tunnel, `None` unless
    /// connected.
    pub fn prefix_list(&self) -> Option<Vec<(Ipv4Addr, Ipv4Addr)>> {
        let lease = self.state.borrow().lease?;
        lease.prefix().map(|prefix| vec![prefix])
    }
}
