//! Command-line interface definitions for the `tether` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser};

/// Top-level CLI for the `tether` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Reconcile a declared compute instance and its network attachments",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Show the changes apply would make, without calling the API.
    #[command(name = "plan")]
    Plan(PlanCommand),
    /// Create or update the instance to match the desired file.
    #[command(name = "apply")]
    Apply(ApplyCommand),
    /// Delete the recorded instance.
    #[command(name = "destroy")]
    Destroy(DestroyCommand),
    /// Re-read the recorded instance and update the state file.
    #[command(name = "refresh")]
    Refresh(RefreshCommand),
    /// List every instance visible to the configured token.
    #[command(name = "list")]
    List,
}

/// Wait options shared by mutating commands.
#[derive(Debug, Args)]
pub(crate) struct WaitArgs {
    /// Wait for the instance to converge before exiting.
    #[arg(long)]
    pub(crate) wait: bool,
    /// Wait budget in seconds. Defaults to `wait_timeout_secs` from
    /// configuration.
    #[arg(long, value_name = "SECS", requires = "wait")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for `tether plan`.
#[derive(Debug, Parser)]
pub(crate) struct PlanCommand {
    /// JSON file with `attributes` and `attachments`.
    #[arg(long, value_name = "FILE")]
    pub(crate) desired: PathBuf,
    /// State file holding the last observed representation.
    #[arg(long, value_name = "FILE")]
    pub(crate) state: Option<PathBuf>,
}

/// Arguments for `tether apply`.
#[derive(Debug, Parser)]
pub(crate) struct ApplyCommand {
    /// JSON file with `attributes` and `attachments`.
    #[arg(long, value_name = "FILE")]
    pub(crate) desired: PathBuf,
    /// State file holding the last observed representation.
    #[arg(long, value_name = "FILE")]
    pub(crate) state: PathBuf,
    #[command(flatten)]
    pub(crate) wait: WaitArgs,
}

/// Arguments for `tether destroy`.
#[derive(Debug, Parser)]
pub(crate) struct DestroyCommand {
    /// State file holding the last observed representation.
    #[arg(long, value_name = "FILE")]
    pub(crate) state: PathBuf,
    #[command(flatten)]
    pub(crate) wait: WaitArgs,
}

/// Arguments for `tether refresh`.
#[derive(Debug, Parser)]
pub(crate) struct RefreshCommand {
    /// State file holding the last observed representation.
    #[arg(long, value_name = "FILE")]
    pub(crate) state: PathBuf,
}
