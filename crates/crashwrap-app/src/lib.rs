//! crashwrap-app: Settings and crash reports for crashwrap
//!
//! This crate holds the parts of the `crashwrap` tool that sit on top of
//! the supervision library: the TOML settings file and the on-disk crash
//! report store.

pub mod report;
pub mod settings;

pub use report::{
    default_report_dir, latest_report, list_reports, prune_reports, read_report, write_report,
    CrashReport, ReportError,
};
pub use settings::{
    load_settings, load_settings_from, save_settings_to, settings_path, Settings, SettingsError,
};
