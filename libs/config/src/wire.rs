//! serde types matching the YAML config file. These are deserialized
//! as-is and then validated into [`DhcpConfig`].
//!
//! [`DhcpConfig`]: crate::DhcpConfig
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_LEASE_SECS: u64 = 60 * 60 * 24;
pub(crate) const DEFAULT_GRACE_SECS: u64 = 60 * 5;
pub(crate) const DEFAULT_DB_FILE: &str = "corral.db";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// address the server identifies itself with (opt 54 / siaddr)
    pub interface_ip: Ipv4Addr,
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    /// domain search list (opt 119), names validated at load
    #[serde(default)]
    pub domain_search: Vec<String>,
    pub dynamic_range: IpRange,
    #[serde(default)]
    pub lease: Lease,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpRange {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lease {
    #[serde(default = "default_lease_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: u64,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_LEASE_SECS,
            grace_period_secs: DEFAULT_GRACE_SECS,
        }
    }
}

fn default_subnet_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}

fn default_grace_secs() -> u64 {
    DEFAULT_GRACE_SECS
}

fn default_db_file() -> String {
    DEFAULT_DB_FILE.to_owned()
}
