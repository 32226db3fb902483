//! Tracking which IP address each monitored MAC currently holds, and the
//! one-shot subnet sweep used to populate the neighbor table at startup.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use mac_address::MacAddress;
use tokio_util::sync::CancellationToken;

use crate::backend::PresenceBackend;
use crate::device::MonitoredDevice;
use crate::neighbor::ArpCache;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceBinding {
    pub mac: MacAddress,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default)]
pub struct MacBindings {
    bindings: Vec<DeviceBinding>,
}

impl MacBindings {
    pub fn new(devices: &[MonitoredDevice]) -> Self {
        let bindings = devices
            .iter()
            .filter_map(MonitoredDevice::mac)
            .map(|mac| DeviceBinding { mac, ip: None })
            .collect();
        MacBindings { bindings }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn all_unbound(&self) -> bool {
        self.bindings.iter().all(|b| b.ip.is_none())
    }

    pub fn ip_for(&self, mac: MacAddress) -> Option<Ipv4Addr> {
        self.bindings
            .iter()
            .find(|b| b.mac == mac)
            .and_then(|b| b.ip)
    }

    /// Bring every binding in line with the latest neighbor table. A MAC
    /// present in the table takes the table's address; a binding whose
    /// address now belongs to a different MAC is cleared.
    pub fn refresh(&mut self, cache: &ArpCache) {
        for binding in &mut self.bindings {
            if let Some(ip) = cache.ip_for_mac(binding.mac) {
                if binding.ip != Some(ip) {
                    match binding.ip {
                        Some(old) => info!("{} moved from {old} to {ip}", binding.mac),
                        None => info!("{} learned at {ip}", binding.mac),
                    }
                    binding.ip = Some(ip);
                }
                continue;
            }

            if let Some(ip) = binding.ip {
                if let Some(owner) = cache.mac_for_ip(ip) {
                    if owner != binding.mac {
                        info!("{} lost {ip}, now held by {owner}", binding.mac);
                        binding.ip = None;
                    }
                }
            }
        }
    }
}

/// The first three octets of a /24 network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubnetPrefix([u8; 3]);

impl SubnetPrefix {
    pub fn of(ip: Ipv4Addr) -> Self {
        let [a, b, c, _] = ip.octets();
        SubnetPrefix([a, b, c])
    }

    pub fn hosts(self) -> impl Iterator<Item = Ipv4Addr> {
        let [a, b, c] = self.0;
        (1..=254).map(move |d| Ipv4Addr::new(a, b, c, d))
    }
}

impl fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}.0/24")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidSubnet;

impl FromStr for SubnetPrefix {
    type Err = InvalidSubnet;

    /// Accepts `a.b.c` or `a.b.c.0/24`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let network = match s.strip_suffix("/24") {
            Some(network) => network.to_string(),
            None if s.split('.').count() == 3 => format!("{s}.0"),
            None => return Err(InvalidSubnet),
        };
        let ip: Ipv4Addr = network.parse().map_err(|_| InvalidSubnet)?;
        Ok(SubnetPrefix::of(ip))
    }
}

/// Most common private /24 in the table. 10.x and 192.168.x networks win
/// over 172.16/12; ties go to the lowest prefix.
pub fn infer_subnet(cache: &ArpCache) -> Option<SubnetPrefix> {
    let mut preferred: HashMap<SubnetPrefix, usize> = HashMap::new();
    let mut other: HashMap<SubnetPrefix, usize> = HashMap::new();

    for entry in cache.entries() {
        let [a, b, ..] = entry.ip.octets();
        let counts = match (a, b) {
            (10, _) | (192, 168) => &mut preferred,
            (172, 16..=31) => &mut other,
            _ => continue,
        };
        *counts.entry(SubnetPrefix::of(entry.ip)).or_default() += 1;
    }

    let most_frequent = |counts: HashMap<SubnetPrefix, usize>| {
        counts
            .into_iter()
            .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then(pb.0.cmp(&pa.0)))
            .map(|(prefix, _)| prefix)
    };
    most_frequent(preferred).or_else(|| most_frequent(other))
}

/// Ping every host in `subnet` once so the OS learns their MAC addresses.
/// Results are discarded. Returns early, leaving the rest of the queue,
/// when `cancel` fires.
pub async fn seed_subnet(
    backend: Arc<dyn PresenceBackend>,
    subnet: SubnetPrefix,
    workers: usize,
    cancel: &CancellationToken,
) {
    info!("Seeding ARP table by pinging {subnet} with {workers} workers");

    let queue: Arc<Mutex<VecDeque<Ipv4Addr>>> = Arc::new(Mutex::new(subnet.hosts().collect()));

    let handles = (0..workers.max(1)).map(|_| {
        let queue = queue.clone();
        let backend = backend.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = queue.lock().map(|mut q| q.pop_front()).unwrap_or(None);
                let Some(ip) = next else { break };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = backend.ping_host(ip, 1) => {}
                }
            }
        })
    });

    for result in futures::future::join_all(handles).await {
        if let Err(err) = result {
            debug!("Seeding worker failed: {err}");
        }
    }

    if cancel.is_cancelled() {
        info!("Subnet seeding interrupted");
    } else {
        debug!("Subnet seeding complete");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::neighbor::{NeighborTableStyle, parse_mac};
    use crate::probe::tests::FakeBackend;

    fn mac(text: &str) -> MacAddress {
        parse_mac(text).unwrap()
    }

    fn table(rows: &[(&str, &str)]) -> ArpCache {
        let output: String = rows
            .iter()
            .map(|(ip, mac)| format!("{ip} dev eth0 lladdr {mac} REACHABLE\n"))
            .collect();
        NeighborTableStyle::IpNeighbor.parse(&output)
    }

    fn bindings() -> MacBindings {
        MacBindings::new(&[
            MonitoredDevice::new("aa:aa:aa:aa:aa:aa"),
            MonitoredDevice::new("bb:bb:bb:bb:bb:bb"),
            MonitoredDevice::new("phone.lan"),
        ])
    }

    #[test]
    fn test_new_binds_only_macs() {
        let bindings = bindings();
        assert!(!bindings.is_empty());
        assert!(bindings.all_unbound());
        assert_eq!(bindings.ip_for(mac("aa:aa:aa:aa:aa:aa")), None);
        assert!(MacBindings::new(&[MonitoredDevice::new("10.0.0.1")]).is_empty());
    }

    #[test]
    fn test_refresh_learns_and_follows_lease_changes() {
        let a = mac("aa:aa:aa:aa:aa:aa");
        let b = mac("bb:bb:bb:bb:bb:bb");
        let mut bindings = bindings();

        bindings.refresh(&table(&[
            ("192.168.1.10", "aa:aa:aa:aa:aa:aa"),
            ("192.168.1.11", "bb:bb:bb:bb:bb:bb"),
        ]));
        assert_eq!(bindings.ip_for(a), Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(bindings.ip_for(b), Some(Ipv4Addr::new(192, 168, 1, 11)));
        assert!(!bindings.all_unbound());

        // a moves to .20; b has dropped out of the table and its old
        // address is handed to a stranger
        bindings.refresh(&table(&[
            ("192.168.1.20", "aa:aa:aa:aa:aa:aa"),
            ("192.168.1.11", "cc:cc:cc:cc:cc:cc"),
        ]));
        assert_eq!(bindings.ip_for(a), Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(bindings.ip_for(b), None);
    }

    #[test]
    fn test_refresh_keeps_binding_when_mac_absent() {
        let a = mac("aa:aa:aa:aa:aa:aa");
        let mut bindings = bindings();
        bindings.refresh(&table(&[("192.168.1.10", "aa:aa:aa:aa:aa:aa")]));

        bindings.refresh(&ArpCache::default());
        assert_eq!(bindings.ip_for(a), Some(Ipv4Addr::new(192, 168, 1, 10)));
    }

    #[test]
    fn test_subnet_prefix_parse() {
        let expected = SubnetPrefix([192, 168, 1]);
        assert_eq!("192.168.1".parse::<SubnetPrefix>(), Ok(expected));
        assert_eq!("192.168.1.0/24".parse::<SubnetPrefix>(), Ok(expected));
        assert_eq!("192.168".parse::<SubnetPrefix>(), Err(InvalidSubnet));
        assert_eq!("192.168.300".parse::<SubnetPrefix>(), Err(InvalidSubnet));
        assert_eq!(expected.hosts().count(), 254);
        assert_eq!(expected.hosts().last(), Some(Ipv4Addr::new(192, 168, 1, 254)));
    }

    #[test]
    fn test_infer_subnet() {
        let cache = table(&[
            ("172.16.0.1", "00:00:00:00:00:01"),
            ("172.16.0.2", "00:00:00:00:00:02"),
            ("172.16.0.3", "00:00:00:00:00:03"),
            ("192.168.1.1", "00:00:00:00:00:04"),
            ("10.0.0.1", "00:00:00:00:00:05"),
            ("10.0.0.2", "00:00:00:00:00:06"),
            ("8.8.8.8", "00:00:00:00:00:07"),
        ]);
        assert_eq!(infer_subnet(&cache), Some(SubnetPrefix([10, 0, 0])));

        let fallback = table(&[("172.20.5.1", "00:00:00:00:00:01")]);
        assert_eq!(infer_subnet(&fallback), Some(SubnetPrefix([172, 20, 5])));

        let public = table(&[("8.8.8.8", "00:00:00:00:00:01")]);
        assert_eq!(infer_subnet(&public), None);
    }

    #[tokio::test]
    async fn test_seed_subnet_pings_every_host() {
        let backend = Arc::new(FakeBackend::default());
        let cancel = CancellationToken::new();

        seed_subnet(backend.clone(), SubnetPrefix([10, 0, 0]), 20, &cancel).await;

        let mut pinged = backend.pinged();
        pinged.sort();
        assert_eq!(pinged, SubnetPrefix([10, 0, 0]).hosts().collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_subnet_stops_when_cancelled() {
        let backend = Arc::new(FakeBackend::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            seed_subnet(backend.clone(), SubnetPrefix([10, 0, 0]), 4, &cancel),
        )
        .await
        .unwrap();

        assert!(backend.pinged().is_empty());
    }
}
