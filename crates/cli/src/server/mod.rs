use homegate_application::ClientNameSource;
use homegate_domain::Config;
use homegate_infrastructure::dhcp::server::LeaseNameSource;
use homegate_infrastructure::dhcp::DhcpServer;
use homegate_infrastructure::dns::DnsServer;
use homegate_infrastructure::system::static_ip::DhcpcdStaticIpCheck;
use std::sync::Arc;
use tracing::info;

/// Wire the two cores together and serve until interrupted. The lease
/// table is the only state they share: the DNS side reads client hostnames
/// from it for reverse questions.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let dhcp = DhcpServer::new(config.dhcp.clone(), Arc::new(DhcpcdStaticIpCheck::new()))?;
    if config.dhcp.enabled {
        dhcp.start().await?;
    }

    let client_names: Arc<dyn ClientNameSource> = LeaseNameSource::new(Arc::clone(&dhcp));
    let dns = DnsServer::new(config.dns.clone(), Some(client_names))?;
    dns.start().await?;

    info!("Homegate ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    dns.stop().await;
    dhcp.stop().await;
    Ok(())
}
