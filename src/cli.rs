//! CLI argument definitions using clap with subcommand architecture

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Incremental workspace-state engine for language tooling
#[derive(Parser, Debug)]
#[command(name = "langd")]
#[command(about = "Incremental workspace-state engine speaking JSON-RPC")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine, serving connections until the client exits
    Serve(ServeArgs),

    /// Relay connections to a shared backend engine
    Forward(ForwardArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Where to accept connections: stdio, tcp;host:port, or unix;/path
    #[arg(long, default_value = "stdio")]
    pub listen: String,

    /// Debounce window for on-disk change batches, in milliseconds
    #[arg(long, default_value = "0")]
    pub watched_file_delay_ms: u64,

    /// Emit progress notifications around each modification batch
    #[arg(long)]
    pub verbose_progress: bool,

    /// Watch this directory natively instead of relying on client events
    #[arg(long)]
    pub watch: Option<PathBuf>,

    /// File extensions the native watcher accepts (repeatable; empty = all)
    #[arg(long = "extension")]
    pub extensions: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ForwardArgs {
    /// Front door for editor connections: stdio, tcp;host:port, or unix;/path
    #[arg(long, default_value = "stdio")]
    pub listen: String,

    /// Backend to relay to: tcp;host:port or unix;/path
    #[arg(long, conflicts_with = "spawn_socket")]
    pub backend: Option<String>,

    /// Spawn (or reuse) a backend process behind this unix socket
    #[arg(long)]
    pub spawn_socket: Option<PathBuf>,
}
