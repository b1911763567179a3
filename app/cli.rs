use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

const DEFAULT_DATA_DIR_NAME: &str = "mws";

#[derive(Clone, Debug, Parser)]
#[command(name = "mws_app", about = "multisig wallet service")]
pub struct Config {
    /// Data directory for the LMDB store. Defaults to the platform data
    /// dir.
    #[arg(long)]
    pub datadir: Option<PathBuf>,
    /// Socket address to serve the HTTP API on.
    #[arg(long, default_value = "127.0.0.1:3232")]
    pub bind_addr: SocketAddr,
    /// Base path the API is mounted under.
    #[arg(long, default_value = "/bws/api")]
    pub base_path: String,
    /// Livenet explorer base URL.
    #[arg(long)]
    pub livenet_explorer_url: Option<url::Url>,
    /// Testnet explorer base URL.
    #[arg(long)]
    pub testnet_explorer_url: Option<url::Url>,
    /// Push server base URL; push notifications are disabled when unset.
    #[arg(long)]
    pub push_server_url: Option<url::Url>,
    /// Directory holding push notification templates.
    #[arg(long, default_value = "templates")]
    pub push_templates_dir: PathBuf,
}

impl Config {
    pub fn datadir(&self) -> anyhow::Result<PathBuf> {
        if let Some(datadir) = &self.datadir {
            return Ok(datadir.clone());
        }
        let Some(base) = dirs::data_dir() else {
            anyhow::bail!(
                "no platform data dir; pass --datadir explicitly"
            );
        };
        Ok(base.join(DEFAULT_DATA_DIR_NAME))
    }
}
