use homegate_domain::{BlockingMode, Config, UpstreamPolicy};

#[test]
fn full_config_parses() {
    let toml = r#"
[dns]
bind_host = "0.0.0.0"
port = 53
protection_enabled = true
blocking_mode = "nxdomain"
blocked_response_ttl = 600
ratelimit = 30
ratelimit_whitelist = ["192.168.1.2"]
refuse_any = true
upstream_dns = ["8.8.8.8:53", "tls://dns.quad9.net"]
bootstrap_dns = ["9.9.9.10"]
all_servers = true
allowed_clients = []
disallowed_clients = ["10.66.0.0/16"]
blocked_hosts = ["||internal.example^"]
cache_size = 1000
cache_min_ttl = 60
cache_max_ttl = 86400
bogus_nxdomain = ["127.0.0.2"]
aaaa_disabled = false
enable_dnssec = true
edns_client_subnet = false
max_inflight = 100
ipset = ["example.com,example.org/allowlist"]
hosts = ["127.0.0.1 router.lan"]

[[dns.rewrites]]
domain = "nas.lan"
answer = "192.168.1.10"

[dhcp]
enabled = true
interface_name = "eth0"
work_dir = "/var/lib/homegate"
db_file_path = "leases.json"

[dhcp.conf4]
gateway_ip = "192.168.1.1"
subnet_mask = "255.255.255.0"
range_start = "192.168.1.100"
range_end = "192.168.1.200"
lease_duration_secs = 86400
icmp_timeout_ms = 1000
options = ["252 ip 192.168.1.1"]

[dhcp.conf6]
range_start = "2001:db8::2"
lease_duration_secs = 86400

[logging]
level = "debug"
"#;

    let config = Config::from_toml(toml).expect("config parses and validates");
    assert_eq!(config.dns.blocking_mode, BlockingMode::NxDomain);
    assert_eq!(config.dns.upstream_policy(), UpstreamPolicy::Parallel);
    assert_eq!(config.dns.blocked_response_ttl, 600);
    assert!(config.dhcp.enabled);
    assert_eq!(
        config.dhcp.db_path().to_string_lossy(),
        "/var/lib/homegate/leases.json"
    );
    let conf4 = config.dhcp.conf4.as_ref().unwrap();
    assert_eq!(conf4.lease_duration_secs, 86400);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn misordered_range_rejected() {
    let toml = r#"
[dhcp]
enabled = true
interface_name = "eth0"

[dhcp.conf4]
gateway_ip = "192.168.1.1"
subnet_mask = "255.255.255.0"
range_start = "192.168.1.200"
range_end = "192.168.1.100"
"#;
    assert!(Config::from_toml(toml).is_err());
}

#[test]
fn dhcp_enabled_without_interface_rejected() {
    let toml = r#"
[dhcp]
enabled = true

[dhcp.conf4]
gateway_ip = "192.168.1.1"
subnet_mask = "255.255.255.0"
range_start = "192.168.1.100"
range_end = "192.168.1.200"
"#;
    assert!(Config::from_toml(toml).is_err());
}

#[test]
fn empty_config_is_valid_dns_only() {
    let config = Config::from_toml("").unwrap();
    assert!(!config.dhcp.enabled);
    assert!(config.dns.protection_enabled);
}
