//! Runs the ISC DHCP client against a private copy of its hooks directory.
//!
//! `dhclient` only reads its enter/exit hook scripts from `/etc/dhcp`. Two
//! clients on one host (say, one for the uplink and one for a VPN tunnel) would
//! fight over that directory, so the [`Launcher`] gives each invocation its own
//! temporary hooks directory and bind-mounts it over `/etc/dhcp` inside a
//! private mount namespace that nobody else can see.
//!
//! ```ignore
//! let launcher = Launcher::new("/run/n2nd", "/run/n2nd/dhclient.conf", "vpnc");
//! let status = launcher.run(Mode::Lease)?;
//! ```

pub mod dhclient;
pub mod error;
pub mod hooks;
pub mod ns;

pub use dhclient::{Launcher, Mode};
pub use error::IsolateError;
pub use hooks::HooksDir;
pub use ns::{Capability, Isolation, IsolationSession, MountNamespaceIsolation, capability};

/// The fixed location dhclient reads its hook scripts from.
pub const DHCP_HOOKS_PATH: &str = "/etc/dhcp";
