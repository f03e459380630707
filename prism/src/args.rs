use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "prism", version, about = "Universal LLM API gateway")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "prism.toml")]
    pub config: PathBuf,

    /// Override the configured listen address.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "gateway=debug,server=debug".
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Disable configuration file watching.
    #[arg(long)]
    pub no_watch: bool,
}
