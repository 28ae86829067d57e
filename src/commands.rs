//! Subcommand implementations

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context};

use crashwrap_app::{
    default_report_dir, latest_report, list_reports, load_settings, load_settings_from,
    prune_reports, read_report, write_report, CrashReport, ReportError,
};
use crashwrap_core::{exit_code, wrap, Capture, WrapConfig, WrapError, WrapOutcome};

use crate::cli::{Commands, RunArgs};

/// Run a subcommand, returning the process exit code
pub fn execute(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run(args) => run(&args),
        Commands::Reports { report_dir, limit } => {
            reports(&resolve_report_dir(report_dir)?, limit)?;
            Ok(0)
        }
        Commands::Show { report_dir, report } => {
            show(&resolve_report_dir(report_dir)?, report.as_deref())?;
            Ok(0)
        }
    }
}

fn resolve_report_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(default_report_dir().ok_or(ReportError::NoReportDir)?),
    }
}

fn run(args: &RunArgs) -> anyhow::Result<i32> {
    let (program, program_args) = args
        .program()
        .ok_or_else(|| anyhow!("No program given"))?;

    let settings = match args.config {
        Some(ref path) => load_settings_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().unwrap_or_else(|e| {
            log::warn!("Failed to load settings, using defaults: {}", e);
            Default::default()
        }),
    };
    let settings = args.merge_into(settings);

    let report_dir = resolve_report_dir(settings.reports.directory.clone())?;
    let keep = settings.reports.keep;
    let program_name = program.to_string_lossy().into_owned();
    let report_args: Vec<String> = program_args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let handler = move |capture: &Capture| {
        let report = CrashReport::new(program_name.clone(), report_args.clone(), capture);
        match write_report(&report_dir, &report) {
            Ok(path) => {
                eprintln!(
                    "crashwrap: {} crashed (exit {}), report saved to {}",
                    report.program,
                    report.exit_status,
                    path.display()
                );
                if let Err(e) = prune_reports(&report_dir, keep) {
                    log::warn!("Failed to prune old reports: {}", e);
                }
            }
            Err(e) => log::error!("Failed to save crash report: {}", e),
        }
    };

    let config = settings
        .apply(WrapConfig::new(handler))
        .command(program, program_args.iter().cloned());

    match wrap(&config) {
        Ok(WrapOutcome::Supervisor {
            exit_status,
            captured,
        }) => Ok(final_exit_code(exit_status, captured, args.crash_exit_code)),
        // crashwrap is itself a payload; the outer supervisor watches stderr
        Ok(WrapOutcome::Payload) => run_unsupervised(Path::new(program), program_args),
        Err(WrapError::Stream {
            stream,
            exit_status,
            captured,
            source,
        }) => {
            log::warn!("Lost child {} after it started: {}", stream, source);
            Ok(final_exit_code(exit_status, captured, args.crash_exit_code))
        }
        Err(e) => Err(e.into()),
    }
}

/// Exit code for a supervised run: `--crash-exit-code` wins after a capture
fn final_exit_code(exit_status: i32, captured: bool, crash_exit_code: Option<i32>) -> i32 {
    match (captured, crash_exit_code) {
        (true, Some(code)) => code,
        _ => exit_status,
    }
}

fn run_unsupervised(program: &Path, args: &[OsString]) -> anyhow::Result<i32> {
    log::info!("Already supervised, running {} directly", program.display());
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run {}", program.display()))?;
    Ok(exit_code(status))
}

fn reports(dir: &Path, limit: usize) -> anyhow::Result<()> {
    let paths = list_reports(dir)?;
    if paths.is_empty() {
        println!("No crash reports in {}", dir.display());
        return Ok(());
    }

    for path in paths.iter().take(limit) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match read_report(path) {
            Ok(report) => println!("{}  {}", name, report.summary()),
            Err(e) => println!("{}  <unreadable: {}>", name, e),
        }
    }

    if paths.len() > limit {
        println!("... {} older", paths.len() - limit);
    }
    Ok(())
}

fn show(dir: &Path, report: Option<&Path>) -> anyhow::Result<()> {
    let path = match report {
        Some(path) if path.is_absolute() || path.exists() => path.to_path_buf(),
        Some(path) => dir.join(path),
        None => latest_report(dir)?
            .ok_or_else(|| anyhow!("No crash reports in {}", dir.display()))?,
    };

    let report = read_report(&path).with_context(|| format!("Failed to read {}", path.display()))?;

    println!("Report:     {}", path.display());
    println!("Program:    {}", report.program);
    if !report.args.is_empty() {
        println!("Arguments:  {}", report.args.join(" "));
    }
    println!("Exit:       {}", report.exit_status);
    println!("Supervisor: PID {}", report.supervisor_pid);
    println!("Captured:   {} (unix time)", report.captured_at);
    println!();
    print!("{}", report.text);
    if !report.text.ends_with('\n') {
        println!();
    }
    Ok(())
}
