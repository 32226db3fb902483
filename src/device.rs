use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use log::debug;
use mac_address::MacAddress;
use tokio::process::Command;

use crate::neighbor::parse_mac;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Hostname,
    Ipv4,
    Mac,
}

/// Classify a device identifier. Anything with exactly five colons is
/// treated as a MAC address, whether or not it parses as one.
pub fn classify(id: &str) -> DeviceKind {
    if id.matches(':').count() == 5 {
        DeviceKind::Mac
    } else if id.parse::<Ipv4Addr>().is_ok() {
        DeviceKind::Ipv4
    } else {
        DeviceKind::Hostname
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoredDevice {
    pub id: String,
    pub kind: DeviceKind,
}

impl MonitoredDevice {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let kind = classify(&id);
        MonitoredDevice { id, kind }
    }

    pub fn mac(&self) -> Option<MacAddress> {
        match self.kind {
            DeviceKind::Mac => parse_mac(&self.id),
            _ => None,
        }
    }
}

impl fmt::Display for MonitoredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A device as seen by one probe cycle: what to call it and where to find it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub name: String,
    pub address: Option<Ipv4Addr>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Option<Ipv4Addr>;
    async fn reverse(&self, address: Ipv4Addr) -> Option<String>;
}

/// Resolve a hostname or IPv4 device. Failure is not an error: the device
/// keeps its identifier as a name and has no address for this cycle.
pub async fn resolve(
    device: &MonitoredDevice,
    resolver: &dyn Resolver,
    reverse_lookup: bool,
) -> ResolvedDevice {
    let address = match device.kind {
        DeviceKind::Ipv4 => device.id.parse().ok(),
        DeviceKind::Hostname => resolver.lookup(&device.id).await,
        DeviceKind::Mac => None,
    };

    let Some(address) = address else {
        debug!("Can't resolve hostname: {}", device.id);
        return ResolvedDevice {
            name: device.id.clone(),
            address: None,
        };
    };

    let name = if reverse_lookup {
        resolver
            .reverse(address)
            .await
            .unwrap_or_else(|| device.id.clone())
    } else {
        device.id.clone()
    };

    ResolvedDevice {
        name,
        address: Some(address),
    }
}

pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Option<Ipv4Addr> {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs
                .filter_map(|addr| match addr.ip() {
                    std::net::IpAddr::V4(ip) => Some(ip),
                    std::net::IpAddr::V6(_) => None,
                })
                .next(),
            Err(err) => {
                debug!("Lookup of {host} failed: {err}");
                None
            }
        }
    }

    async fn reverse(&self, address: Ipv4Addr) -> Option<String> {
        if cfg!(windows) {
            return None;
        }
        let output = Command::new("getent")
            .args(["hosts", &address.to_string()])
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_getent(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_getent(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}
