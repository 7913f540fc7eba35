// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Snappager CLI
//!
//! Command-line interface for the snappager demand-paging engine.

use clap::{Args, Parser, Subcommand};

mod commands;

/// Snappager - userfaultfd page server for restored microVM snapshots
#[derive(Parser)]
#[command(name = "snappager")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve page faults for one VM until the hypervisor disconnects
    Serve(ServeArgs),

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Configuration file path; replaces every other flag
    #[arg(short, long, conflicts_with_all = ["socket", "memory_file"])]
    pub config: Option<String>,

    /// Handshake socket path
    #[arg(short, long, required_unless_present = "config")]
    pub socket: Option<String>,

    /// Snapshot memory file (a recipe in lazy mode)
    #[arg(short, long, required_unless_present = "config")]
    pub memory_file: Option<String>,

    /// Write every served page to this CSV file
    #[arg(long)]
    pub trace_file: Option<String>,

    /// Pages to pre-populate on the first fault
    #[arg(long)]
    pub working_set_file: Option<String>,

    /// Working-set insertion workers
    #[arg(short, long, default_value_t = 8)]
    pub threads: usize,

    /// Treat the memory file as a chunk recipe
    #[arg(long, requires = "chunk_dir")]
    pub lazy: bool,

    /// Directory holding chunks named by hex hash
    #[arg(long)]
    pub chunk_dir: Option<String>,

    /// Bytes of guest memory per chunk
    #[arg(long, default_value_t = 4096)]
    pub chunk_size: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Serve(args) => commands::serve::execute(args).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
