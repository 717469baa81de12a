//! Keeps an n2n `edge` tunnel connected.
//!
//! A [`Supervisor`] spawns the edge daemon, waits for its tap interface,
//! runs a DHCP client on it through the `libisolate` launcher and reports
//! up/down transitions to a [`LinkObserver`]. Any failure tears the attempt
//! down and retries after a fixed backoff.

mod actor;
pub mod config;
pub mod error;
pub mod lease;
pub mod netif;
pub mod process;
pub mod supervisor;
pub mod watcher;

pub use config::{EdgeConfig, N2nConfig, SupervisorConfig, load_config};
pub use error::Failure;
pub use lease::Lease;
pub use netif::{NetProbe, NetlinkProbe};
pub use process::{Child, CommandSpec, OsSpawner, ProcessHandle, ProcessKind, Spawner};
pub use supervisor::{Backends, LinkObserver, Phase, Snapshot, Supervisor};
pub use watcher::{AddressWatcher, WatchConfig, WatchOutcome, WatcherState};
