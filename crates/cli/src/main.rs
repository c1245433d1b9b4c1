//! # Homegate
//!
//! A home-network DNS forwarding resolver with a built-in authoritative
//! DHCP server.

mod bootstrap;
mod server;

use clap::Parser;

#[derive(Parser)]
#[command(name = "homegate")]
#[command(version)]
#[command(about = "DNS forwarder and DHCP server for small networks")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "homegate.toml")]
    config: String,

    /// Override the DNS listen port
    #[arg(short = 'p', long)]
    dns_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = bootstrap::load_config(&cli.config)?;
    if let Some(port) = cli.dns_port {
        config.dns.port = port;
    }
    bootstrap::init_logging(&config);

    server::run(config).await
}
