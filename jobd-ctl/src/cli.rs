use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jobd-ctl")]
#[command(version, about = "Run executables under kernel-enforced resource limits", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a command and capture its output under /var/lib/jobs/<id>/
    jobd-ctl run /bin/echo hello

    # Half a core, 100 MiB, throttled I/O
    jobd-ctl run --cpu 500m --memory 100M --io-class low /usr/bin/stress --cpu 4

    # Kill the job after ten seconds
    jobd-ctl run --timeout 10 /bin/sleep 30

    # Verify the host can supervise jobs
    jobd-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a job and wait for it to finish
    Run {
        /// Executable to run
        executable: String,

        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// CPU limit (500m, 2, max)
        #[arg(long, value_name = "SPEC")]
        cpu: Option<String>,

        /// Memory ceiling (100M, bytes, max)
        #[arg(long, value_name = "SPEC")]
        memory: Option<String>,

        /// I/O bandwidth class (low, med, high)
        #[arg(long, value_name = "CLASS")]
        io_class: Option<String>,

        /// Stop the job after SECONDS
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },

    /// Check job supervision requirements
    Check,
}
