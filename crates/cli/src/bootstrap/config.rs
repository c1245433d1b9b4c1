use homegate_domain::Config;
use tracing::info;

/// Load and validate the configuration. A missing file yields the
/// defaults, so a bare `homegate` still serves DNS.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(text) => Config::from_toml(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("config file {path} not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(anyhow::anyhow!("read {path}: {e}")),
    };

    info!(
        config_file = path,
        dns_port = config.dns.port,
        dhcp_enabled = config.dhcp.enabled,
        "Configuration loaded"
    );
    Ok(config)
}
