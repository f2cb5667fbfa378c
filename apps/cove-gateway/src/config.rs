use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "cove-gateway",
    author,
    version,
    about = "Real-time collaboration gateway"
)]
pub struct Cli {
    /// Port the listener binds on; serves both the connection upgrade
    /// endpoint and the control endpoints.
    #[arg(long, env = "COVE_PORT", default_value_t = 8787)]
    pub port: u16,

    /// Address to bind on.
    #[arg(long, env = "COVE_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Product id tokens must carry to be admitted.
    #[arg(long, env = "COVE_PRODUCT_ID", default_value = "cove")]
    pub product_id: String,

    /// Accounts service URL, handed to clients redirected through the
    /// upgrade path.
    #[arg(long, env = "COVE_ACCOUNTS_URL", default_value = "http://127.0.0.1:8080")]
    pub accounts_url: String,

    /// Version string reported by the version endpoint.
    #[arg(long, env = "COVE_MODEL_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub model_version: String,

    /// Allow per-frame compression for sessions that negotiate it.
    #[arg(long, env = "COVE_ENABLE_COMPRESSION", default_value_t = false)]
    pub enable_compression: bool,

    /// Minutes an empty workspace lingers before eviction.
    #[arg(long, env = "COVE_SOFT_SHUTDOWN_TICKS", default_value_t = 3)]
    pub soft_shutdown_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub product_id: String,
    pub accounts_url: String,
    pub model_version: String,
    pub enable_compression: bool,
    pub soft_shutdown_ticks: u32,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = format!("{}:{}", cli.bind_addr, cli.port)
            .parse()
            .with_context(|| format!("invalid listen address: {}:{}", cli.bind_addr, cli.port))?;
        Ok(ServerConfig {
            listen_addr,
            product_id: cli.product_id,
            accounts_url: cli.accounts_url,
            model_version: cli.model_version,
            enable_compression: cli.enable_compression,
            soft_shutdown_ticks: cli.soft_shutdown_ticks,
        })
    }
}
