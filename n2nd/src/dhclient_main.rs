use std::time::Duration;

use anyhow::{Context, Result};
use libisolate::{Launcher, Mode};
use log::{info, warn};

use crate::cli::LauncherArgs;

/// Runs the launcher in this process and returns the exit code to use.
///
/// Must not be called from inside a tokio runtime.
pub fn main(args: LauncherArgs, mode: Mode) -> Result<i32> {
    let mut launcher = Launcher::new(&args.work_dir, &args.config, &args.interface);
    launcher.dhclient = args.dhclient;
    launcher.hooks_source = args.hooks_dir;
    launcher.grace = Duration::from_millis(args.grace_ms);

    let status = launcher
        .run(mode)
        .with_context(|| format!("Failed to run dhclient ({mode:?}) on {}", args.interface))?;
    if status.success() {
        info!("dhclient ({mode:?}) on {} finished", args.interface);
        return Ok(0);
    }
    warn!("dhclient ({mode:?}) on {} exited with {status}", args.interface);
    Ok(status.code().unwrap_or(1))
}
