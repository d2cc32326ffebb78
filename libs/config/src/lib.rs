#![allow(clippy::len_without_is_empty)]

//! # config
//!
//! YAML configuration for the corral DHCP server. The wire format lives
//! in [`wire`]; [`DhcpConfig`] is the validated form the rest of the
//! server consumes. Parsing fails (and the server refuses to start) on
//! an inverted range, an invalid domain search name, or YAML that does
//! not deserialize.
use std::{net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use tracing::debug;
use hickory_proto::rr::Name;

pub mod wire;

/// An inclusive IPv4 range `from..=to`. Constructing one checks
/// `from <= to`, so a held `Range` is always well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    from: Ipv4Addr,
    to: Ipv4Addr,
}

impl Range {
    pub fn new(from: Ipv4Addr, to: Ipv4Addr) -> Result<Self> {
        if u32::from(from) > u32::from(to) {
            bail!("range is improperly specified: {from} -> {to}");
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> Ipv4Addr {
        self.from
    }

    pub fn to(&self) -> Ipv4Addr {
        self.to
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.from)..=u32::from(self.to)).contains(&u32::from(ip))
    }

    /// number of addresses in the range, always at least one
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.to)) - u64::from(u32::from(self.from)) + 1
    }
}

/// Validated server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpConfig {
    interface_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    gateway: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    domain_search: Vec<Name>,
    dynamic_range: Range,
    lease_duration: Duration,
    grace_period: Duration,
    db_file: String,
}

impl DhcpConfig {
    /// read & parse the config file at `path`
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse_str(&content)
    }

    /// parse config from a YAML string
    pub fn parse_str(content: &str) -> Result<Self> {
        let wire: wire::Config =
            serde_yaml::from_str(content).context("error parsing configuration")?;
        let cfg = Self::try_from(wire)?;
        debug!(range = ?cfg.dynamic_range, lease = ?cfg.lease_duration, "loaded config");
        Ok(cfg)
    }

    pub fn interface_ip(&self) -> Ipv4Addr {
        self.interface_ip
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet_mask
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns_servers
    }

    pub fn domain_search(&self) -> &[Name] {
        &self.domain_search
    }

    pub fn dynamic_range(&self) -> Range {
        self.dynamic_range
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn db_file(&self) -> &str {
        &self.db_file
    }
}

impl TryFrom<wire::Config> for DhcpConfig {
    type Error = anyhow::Error;

    fn try_from(wire: wire::Config) -> Result<Self> {
        let dynamic_range = Range::new(wire.dynamic_range.from, wire.dynamic_range.to)
            .context("could not validate dynamic range")?;
        let domain_search = wire
            .domain_search
            .iter()
            .map(|name| {
                Name::from_utf8(name).with_context(|| format!("invalid search domain {name:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            interface_ip: wire.interface_ip,
            subnet_mask: wire.subnet_mask,
            gateway: wire.gateway,
            dns_servers: wire.dns_servers,
            domain_search,
            dynamic_range,
            lease_duration: Duration::from_secs(wire.lease.duration_secs),
            grace_period: Duration::from_secs(wire.lease.grace_period_secs),
            db_file: wire.db_file,
        })
    }
}
