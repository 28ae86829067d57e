//! crashwrap - Run a program as a monitored child and keep its crash output
//!
//! The supervision itself lives in `crashwrap-core`; this binary adds
//! settings, crash reports, and a command line.

mod cli;
mod commands;

use cli::Cli;

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.log_level.as_deref());

    let code = commands::execute(cli.command)?;
    std::process::exit(code);
}
