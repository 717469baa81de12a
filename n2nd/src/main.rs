mod cli;
mod dhclient_main;
mod run;

use clap::Parser;
use cli::{Cli, Commands};
use libisolate::Mode;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { config } => run::main(&config).map(|_| 0),
        Commands::Dhclient(args) => dhclient_main::main(args, Mode::Lease),
        Commands::DhclientRelease(args) => dhclient_main::main(args, Mode::Release),
    };
    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e:?}");
            std::process::exit(1);
        }
    }
}
