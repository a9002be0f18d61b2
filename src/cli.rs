use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::net::SocketAddr;

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "subpool",
    version,
    about = "Subscription aggregator that live-tests proxy servers through xray-core",
    long_about = "subpool - Fetch public proxy subscription feeds, test every server's real \
                  reachability through per-server xray-core instances, and serve the ranked \
                  working set over HTTP. Runtime behavior is configured via environment \
                  variables (SUB_URLS, XRAY_PATH, CACHE_INTERVAL_SECONDS, ...)."
)]
pub struct Args {
    /// Address for the HTTP surface
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Enable debug mode
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid listen address: {}", self.listen))?;
        Ok(())
    }
}
