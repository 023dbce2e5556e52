use console::style;
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::env;
use std::io::Write;

/// Logger for jobd-ctl. Lines carry the emitting module so the job
/// lifecycle messages coming out of the library are attributable:
///
/// ```text
/// info  [jobd::job] job 4f0c...: started: ["/bin/echo", "hello"]
/// ```
///
/// `--verbose` lowers the default level to debug; an explicit `RUST_LOG`
/// filter spec wins over both.
pub fn init_logger(verbose: bool) {
    let mut builder = Builder::new();

    builder
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => style("error").red().bold(),
                Level::Warn => style("warn").yellow().bold(),
                Level::Info => style("info").green(),
                Level::Debug => style("debug").cyan(),
                Level::Trace => style("trace").dim(),
            };
            writeln!(
                buf,
                "{:<5} [{}] {}",
                level,
                style(record.target()).dim(),
                record.args()
            )
        });

    if let Ok(spec) = env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    builder.init();
}
