use console::style;
use log::{debug, info};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jobd::{ApiStatus, Registry, ResourceRequest, StartRequest};

/// Configuration for one supervised run
pub struct RunConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub io_class: Option<String>,
    pub timeout: Option<u64>,
}

pub fn run_job(config: RunConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(Registry::new());

    let request = StartRequest {
        executable: config.executable,
        args: config.args,
        limits: ResourceRequest {
            cpu: config.cpu,
            memory: config.memory,
            io_class: config.io_class,
        },
    };
    debug!("start request: {:?}", request);

    let id = registry.start_job(&request)?;
    info!("started job {}", id);

    if let Some(secs) = config.timeout {
        let registry = Arc::clone(&registry);
        let job_id = id.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            match registry.stop_job(&job_id) {
                Ok((status, exit_code)) => {
                    info!(
                        "job {} stopped after {}s timeout: status={} exit={}",
                        job_id, secs, status, exit_code
                    );
                }
                Err(e) => debug!("timeout stop for job {}: {}", job_id, e),
            }
        });
    }

    let (status, exit_code) = registry.wait_job(&id)?;
    let (stdout_path, stderr_path) = registry.sink_paths(&id)?;

    let status_styled = match status {
        ApiStatus::Exited if exit_code == 0 => style(status).green().bold(),
        ApiStatus::Exited | ApiStatus::Stopped => style(status).yellow().bold(),
        _ => style(status).red().bold(),
    };

    println!(
        "{}={} | {}={} | {}={} | {}={} | {}={}",
        style("job").dim(),
        id,
        style("status").dim(),
        status_styled,
        style("exit_code").dim(),
        style(exit_code).bold(),
        style("stdout").dim(),
        stdout_path.display(),
        style("stderr").dim(),
        stderr_path.display(),
    );

    if exit_code >= 0 {
        std::process::exit(exit_code);
    }
    // Sentinel exit codes (spawn failure, signal) map to a generic failure.
    std::process::exit(1);
}
