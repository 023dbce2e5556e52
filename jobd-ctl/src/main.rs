//! jobd controller CLI - run executables under kernel-enforced limits

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::check_requirements;
use runner::{RunConfig, run_job};

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match cli.command {
        Commands::Run {
            executable,
            args,
            cpu,
            memory,
            io_class,
            timeout,
        } => {
            let config = RunConfig {
                executable,
                args,
                cpu,
                memory,
                io_class,
                timeout,
            };
            if let Err(e) = run_job(config) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Check => check_requirements(),
    }
}
