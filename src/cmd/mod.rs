//! CLI command handlers

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Check configuration, vault, and database health without starting the server
    Diagnostics,
}
