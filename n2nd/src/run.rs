use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libn2n::{Backends, LinkObserver, Supervisor, load_config};
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

/// Reports transitions to the log.
struct LogObserver {
    interface: String,
}

impl LinkObserver for LogObserver {
    fn on_up(&self) -> Result<()> {
        info!("tunnel {} is up", self.interface);
        Ok(())
    }

    fn on_down(&self) {
        warn!("tunnel {} is down", self.interface);
    }
}

pub fn main(config: &Path) -> Result<()> {
    let cfg = load_config(config)?
        .into_supervisor_config()
        .context("Invalid n2nd configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        let observer = Arc::new(LogObserver {
            interface: cfg.interface.clone(),
        });
        let backends = Backends::os().context("Failed to set up netlink")?;
        let supervisor = Supervisor::new(cfg, backends, observer);
        supervisor.start();
        info!("n2nd supervising {}", supervisor.interface_name());

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        supervisor.stop().await;
        info!("n2nd stopped");
        Ok::<(), anyhow::Error>(())
    })
}
