use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::netif::NetProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub interval: Duration,
    /// Consecutive positive polls needed before the address counts as acquired.
    pub stable_polls: u32,
    /// Total polls before giving up.
    pub max_polls: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stable_polls: 3,
            max_polls: 30,
        }
    }
}

/// Stabilisation counter.
///
/// Counts polls that saw any IPv4 address. A different address than last
/// time still counts; only the absence of an address resets the counter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatcherState {
    pub consecutive: u32,
    pub last_seen: Option<Ipv4Network>,
}

impl WatcherState {
    /// Records one poll and returns the new consecutive count.
    pub fn observe(&mut self, address: Option<Ipv4Network>) -> u32 {
        match address {
            Some(addr) => {
                self.consecutive += 1;
                self.last_seen = Some(addr);
            }
            None => {
                self.consecutive = 0;
                self.last_seen = None;
            }
        }
        self.consecutive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Acquired(Ipv4Network),
    TimedOut { polls: u32 },
}

/// Polls one interface until its IPv4 address settles.
pub struct AddressWatcher {
    probe: Arc<dyn NetProbe>,
    interface: String,
    cfg: WatchConfig,
}

impl AddressWatcher {
    pub fn new(probe: Arc<dyn NetProbe>, interface: impl Into<String>, cfg: WatchConfig) -> Self {
        Self {
            probe,
            interface: interface.into(),
            cfg,
        }
    }

    /// Runs to completion. Returns `None` once `token` is cancelled.
    pub async fn run(&self, token: &CancellationToken) -> Option<WatchOutcome> {
        let mut state = WatcherState::default();
        let mut polls = 0;
        loop {
            if token.is_cancelled() {
                return None;
            }
            let address = match self.probe.ipv4_address(&self.interface).await {
                Ok(address) => address,
                Err(e) => {
                    warn!("failed to query addresses of {}: {e:#}", self.interface);
                    None
                }
            };
            polls += 1;
            let consecutive = state.observe(address);
            debug!(
                "address poll {polls}/{} on {}: {:?} ({consecutive} stable)",
                self.cfg.max_polls, self.interface, state.last_seen
            );
            if consecutive >= self.cfg.stable_polls {
                if let Some(addr) = state.last_seen {
                    info!("acquired {addr} on {}", self.interface);
                    return Some(WatchOutcome::Acquired(addr));
                }
            }
            if polls >= self.cfg.max_polls {
                return Some(WatchOutcome::TimedOut { polls });
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.cfg.interval) => {}
            }
        }
    }

    /// Runs on its own task and hands the outcome to `deliver`, unless the
    /// token was cancelled first.
    pub fn spawn<F>(self, token: CancellationToken, deliver: F) -> JoinHandle<()>
    where
        F: FnOnce(WatchOutcome) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.run(&token).await;
            match outcome {
                Some(outcome) if !token.is_cancelled() => deliver(outcome),
                _ => debug!("address watcher on {} cancelled", self.interface),
            }
        })
    }
}
