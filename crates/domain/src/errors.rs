use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid domain name: {0}")]
    InvalidDomainName(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid DNS response: {0}")]
    InvalidDnsResponse(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Query timeout")]
    QueryTimeout,

    #[error("All upstream servers failed")]
    AllUpstreamsFailed,

    #[error("Static lease already exists")]
    StaticLeaseExists,

    #[error("Lease not found")]
    LeaseNotFound,

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Server is not running")]
    NotRunning,

    #[error("Unknown interface: {0}")]
    UnknownInterface(String),
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        DomainError::IoError(e.to_string())
    }
}
