use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nix::unistd::{Group, User};
use serde::Deserialize;

use crate::watcher::WatchConfig;

/// Head start the launcher helper gets over the supervisor's SIGKILL, so it
/// can stop dhclient and clean up first.
const HELPER_GRACE_MARGIN: Duration = Duration::from_secs(2);

/// How to run the n2n edge daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeConfig {
    pub binary: PathBuf,
    /// `host:port` of the supernode.
    pub supernode: String,
    pub community: String,
    pub key: String,
    /// Credentials edge drops to after creating the tap device.
    pub uid: u32,
    pub gid: u32,
}

impl EdgeConfig {
    /// Foreground edge with a DHCP-assigned address on `interface`.
    pub fn args(&self, interface: &str) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-l".to_string(),
            self.supernode.clone(),
            "-r".to_string(),
            "-a".to_string(),
            "dhcp:0.0.0.0".to_string(),
            "-d".to_string(),
            interface.to_string(),
            "-c".to_string(),
            self.community.clone(),
            "-k".to_string(),
            self.key.clone(),
            "-u".to_string(),
            self.uid.to_string(),
            "-g".to_string(),
            self.gid.to_string(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub edge: EdgeConfig,
    pub interface: String,
    /// Holds edge.log and the DHCP client's config, pid, lease and output files.
    pub work_dir: PathBuf,
    /// Program re-executed as `<helper> dhclient ...` to run the DHCP client
    /// in its own mount namespace.
    pub helper_program: PathBuf,
    pub dhclient_binary: PathBuf,
    pub hooks_dir: Option<PathBuf>,
    pub backoff: Duration,
    pub poll_interval: Duration,
    pub interface_polls: u32,
    pub address_polls: u32,
    pub stable_polls: u32,
    /// Grace period between the polite signal and SIGKILL.
    pub stop_grace: Duration,
    pub release_timeout: Duration,
    pub release_on_stop: bool,
}

impl SupervisorConfig {
    pub fn new(edge: EdgeConfig) -> Self {
        Self {
            edge,
            interface: "vpnc".to_string(),
            work_dir: PathBuf::from("/run/n2nd"),
            helper_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("n2nd")),
            dhclient_binary: PathBuf::from(libisolate::dhclient::DHCLIENT_BINARY),
            hooks_dir: None,
            backoff: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            interface_polls: 10,
            address_polls: 30,
            stable_polls: 3,
            stop_grace: Duration::from_secs(5),
            release_timeout: Duration::from_secs(10),
            release_on_stop: true,
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            interval: self.poll_interval,
            stable_polls: self.stable_polls,
            max_polls: self.address_polls,
        }
    }

    pub fn edge_log(&self) -> PathBuf {
        self.work_dir.join("edge.log")
    }

    pub fn dhclient_config(&self) -> PathBuf {
        self.work_dir.join(libisolate::dhclient::CONFIG_FILE)
    }

    /// How long the launcher helper waits for dhclient after SIGTERM.
    /// Always strictly shorter than `stop_grace`.
    pub fn helper_grace(&self) -> Duration {
        if self.stop_grace > HELPER_GRACE_MARGIN * 2 {
            self.stop_grace - HELPER_GRACE_MARGIN
        } else {
            self.stop_grace / 2
        }
    }

    /// Arguments for the launcher helper, `subcommand` being `dhclient` or
    /// `dhclient-release`.
    pub fn helper_args(&self, subcommand: &str) -> Vec<String> {
        let mut args = vec![
            subcommand.to_string(),
            "--work-dir".to_string(),
            self.work_dir.display().to_string(),
            "--config".to_string(),
            self.dhclient_config().display().to_string(),
            "--interface".to_string(),
            self.interface.clone(),
            "--dhclient".to_string(),
            self.dhclient_binary.display().to_string(),
            "--grace-ms".to_string(),
            self.helper_grace().as_millis().to_string(),
        ];
        if let Some(hooks) = &self.hooks_dir {
            args.push("--hooks-dir".to_string());
            args.push(hooks.display().to_string());
        }
        args
    }
}

/// On-disk YAML configuration of the `n2nd` daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct N2nConfig {
    pub supernode: String,
    pub community: String,
    pub key: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_account")]
    pub user: String,
    #[serde(default = "default_account")]
    pub group: String,
    #[serde(default = "default_edge_binary")]
    pub edge_binary: PathBuf,
    #[serde(default = "default_dhclient_binary")]
    pub dhclient_binary: PathBuf,
    pub hooks_dir: Option<PathBuf>,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_interface_polls")]
    pub interface_polls: u32,
    #[serde(default = "default_address_polls")]
    pub address_polls: u32,
    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,
    #[serde(default = "default_true")]
    pub release_on_stop: bool,
}

fn default_interface() -> String {
    "vpnc".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/run/n2nd")
}

fn default_account() -> String {
    "nobody".to_string()
}

fn default_edge_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/edge")
}

fn default_dhclient_binary() -> PathBuf {
    PathBuf::from(libisolate::dhclient::DHCLIENT_BINARY)
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_interface_polls() -> u32 {
    10
}

fn default_address_polls() -> u32 {
    30
}

fn default_stable_polls() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl N2nConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("supernode", &self.supernode),
            ("community", &self.community),
            ("key", &self.key),
            ("interface", &self.interface),
        ] {
            if value.trim().is_empty() {
                bail!("`{name}` must not be empty");
            }
        }
        for (name, value) in [
            ("interface_polls", self.interface_polls),
            ("address_polls", self.address_polls),
            ("stable_polls", self.stable_polls),
        ] {
            if value == 0 {
                bail!("`{name}` must be at least 1");
            }
        }
        if self.stable_polls > self.address_polls {
            bail!(
                "`stable_polls` ({}) cannot exceed `address_polls` ({})",
                self.stable_polls,
                self.address_polls
            );
        }
        Ok(())
    }

    /// Resolves the account names and builds the supervisor settings.
    pub fn into_supervisor_config(self) -> Result<SupervisorConfig> {
        let uid = User::from_name(&self.user)
            .with_context(|| format!("Failed to look up user {}", self.user))?
            .with_context(|| format!("No such user: {}", self.user))?
            .uid
            .as_raw();
        let gid = Group::from_name(&self.group)
            .with_context(|| format!("Failed to look up group {}", self.group))?
            .with_context(|| format!("No such group: {}", self.group))?
            .gid
            .as_raw();

        let edge = EdgeConfig {
            binary: self.edge_binary,
            supernode: self.supernode,
            community: self.community,
            key: self.key,
            uid,
            gid,
        };
        let mut cfg = SupervisorConfig::new(edge);
        cfg.interface = self.interface;
        cfg.work_dir = self.work_dir;
        cfg.dhclient_binary = self.dhclient_binary;
        cfg.hooks_dir = self.hooks_dir;
        cfg.backoff = Duration::from_secs(self.backoff_secs);
        cfg.interface_polls = self.interface_polls;
        cfg.address_polls = self.address_polls;
        cfg.stable_polls = self.stable_polls;
        cfg.release_on_stop = self.release_on_stop;
        Ok(cfg)
    }
}

pub fn parse_config(content: &str) -> Result<N2nConfig> {
    let cfg: N2nConfig = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<N2nConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content)
}
