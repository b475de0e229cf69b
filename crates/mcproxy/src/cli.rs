use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mcproxy",
    version,
    about = "Security-enforcing proxy for MCP JSON-RPC traffic"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address as host:port (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Downstream MCP server WebSocket URL (overrides config file setting)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Security-event log path (overrides config file setting)
    #[arg(long)]
    pub event_log: Option<PathBuf>,

    /// Force strict mode on, regardless of the config file
    #[arg(long)]
    pub strict: bool,
}
