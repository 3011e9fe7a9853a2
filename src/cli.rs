//! Command-line argument definitions.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wsftp", about = "SFTP-over-WebSocket filesystem", version)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve a directory tree over WebSocket
    Serve(ServeArgs),
    /// Search a remote tree with a glob pattern
    Find(FindArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4002")]
    pub listen: SocketAddr,

    /// Subtree exposed as "/" (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Reject every mutating operation
    #[arg(long)]
    pub read_only: bool,

    /// Strip uid/gid from outbound attributes
    #[arg(long)]
    pub hide_uid_gid: bool,
}

#[derive(Args)]
pub struct FindArgs {
    /// Server endpoint, e.g. ws://host:4002/
    pub url: String,

    /// Glob pattern (*, ?, ** supported)
    pub pattern: String,

    /// Directory to start from
    #[arg(long, default_value = "/")]
    pub base: String,

    /// Basic-auth username
    #[arg(long)]
    pub username: Option<String>,

    /// Basic-auth password
    #[arg(long)]
    pub password: Option<String>,
}
