//! CLI argument parsing for crashwrap

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crashwrap_app::Settings;

/// crashwrap - Run a program under a supervisor that captures its crash output
#[derive(Parser, Debug)]
#[command(name = "crashwrap")]
#[command(about = "Run a program under a supervisor that captures its crash output")]
#[command(version)]
pub struct Cli {
    /// Log level (overrides RUST_LOG)
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program and save a report if it crashes
    Run(RunArgs),

    /// List saved crash reports, newest first
    Reports {
        /// Report directory
        #[arg(long = "report-dir")]
        report_dir: Option<PathBuf>,

        /// Maximum number of reports to list
        #[arg(short = 'n', long = "limit", default_value = "10")]
        limit: usize,
    },

    /// Print a crash report (default: the latest)
    Show {
        /// Report directory
        #[arg(long = "report-dir")]
        report_dir: Option<PathBuf>,

        /// Report file, absolute or relative to the report directory
        report: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Don't echo captured crash output to stderr
    #[arg(long = "hide")]
    pub hide: bool,

    /// Milliseconds a partial signature match may wait (0 = until EOF)
    #[arg(long = "patience-ms")]
    pub patience_ms: Option<u64>,

    /// Milliseconds of silence that end a capture (0 = until EOF)
    #[arg(long = "quiet-period-ms")]
    pub quiet_period_ms: Option<u64>,

    /// Crash signature; repeat to replace the configured set
    #[arg(long = "signature", value_name = "S")]
    pub signatures: Vec<String>,

    /// Settings file (default: the platform config directory)
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Report directory
    #[arg(long = "report-dir", value_name = "DIR")]
    pub report_dir: Option<PathBuf>,

    /// Exit code to use when a crash was captured
    #[arg(long = "crash-exit-code", value_name = "N")]
    pub crash_exit_code: Option<i32>,

    /// Program to run, followed by its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

impl RunArgs {
    /// Program and arguments to supervise
    pub fn program(&self) -> Option<(&OsString, &[OsString])> {
        self.command.split_first()
    }

    /// Overlay command-line flags onto loaded settings
    pub fn merge_into(&self, mut settings: Settings) -> Settings {
        if self.hide {
            settings.capture.hide = true;
        }
        if let Some(ms) = self.patience_ms {
            settings.capture.patience_ms = ms;
        }
        if let Some(ms) = self.quiet_period_ms {
            settings.capture.quiet_period_ms = ms;
        }
        if !self.signatures.is_empty() {
            settings.capture.signatures = self.signatures.clone();
        }
        if let Some(ref dir) = self.report_dir {
            settings.reports.directory = Some(dir.clone());
        }
        settings
    }
}
