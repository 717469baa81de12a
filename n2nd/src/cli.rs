use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "n2nd", version, about = "n2n tunnel supervisor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep the tunnel described by the config file connected
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run dhclient with private hook scripts until interrupted
    #[command(hide = true)]
    Dhclient(LauncherArgs),
    /// Release the lease held by a previous `dhclient` run
    #[command(hide = true)]
    DhclientRelease(LauncherArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LauncherArgs {
    /// Directory holding the pid, lease and output files
    #[arg(long, value_name = "DIR")]
    pub work_dir: PathBuf,

    /// dhclient configuration file
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    #[arg(long)]
    pub interface: String,

    /// Directory with dhclient-enter-hooks and dhclient-exit-hooks
    #[arg(long, value_name = "DIR")]
    pub hooks_dir: Option<PathBuf>,

    #[arg(long, value_name = "PATH", default_value = libisolate::dhclient::DHCLIENT_BINARY)]
    pub dhclient: PathBuf,

    /// Milliseconds dhclient gets after SIGTERM before it is killed
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    pub grace_ms: u64,
}
