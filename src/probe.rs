use log::debug;
use rand::seq::SliceRandom as _;

use crate::backend::{PresenceBackend, parse_received};
use crate::device::ResolvedDevice;
use crate::neighbor::ArpCache;

/// Read the neighbor table. Any failure yields an empty cache so detection
/// falls back to pinging.
pub async fn get_arp_cache(backend: &dyn PresenceBackend) -> ArpCache {
    match backend.query_neighbor_table().await {
        Ok(dump) => dump.style.parse(&dump.output),
        Err(err) => {
            debug!("Neighbor table unavailable: {err:#}");
            ArpCache::default()
        }
    }
}

pub fn arp_contains_any(devices: &[ResolvedDevice], cache: &ArpCache) -> bool {
    debug!("Checking ARP Cache...");
    for device in devices {
        match device.address {
            Some(ip) if cache.contains_ip(ip) => {
                debug!("** Found in ARP Cache: {} [{ip}]", device.name);
                return true;
            }
            Some(ip) => debug!("** Not in ARP Cache: {} [{ip}]", device.name),
            None => debug!("** Not in ARP Cache: {} [no address]", device.name),
        }
    }
    false
}

/// Ping each addressable device until one answers.
pub async fn ping_check(
    backend: &dyn PresenceBackend,
    devices: &[ResolvedDevice],
    count: u8,
    randomize: bool,
) -> bool {
    debug!("Pinging remote hosts...");

    let mut order: Vec<&ResolvedDevice> = devices.iter().collect();
    if randomize {
        order.shuffle(&mut rand::rng());
    }

    for device in order {
        let Some(ip) = device.address else {
            debug!("** Invalid Device: {} (no ip address)", device.name);
            continue;
        };

        let received = match backend.ping_host(ip, count).await {
            Ok(output) => parse_received(&output),
            Err(err) => {
                debug!("** Ping of {} [{ip}] failed: {err:#}", device.name);
                0
            }
        };

        if received > 0 {
            debug!("** Got Ping reply from: {} [{ip}]", device.name);
            return true;
        }
        debug!("** No Ping reply from: {} [{ip}]", device.name);
    }
    false
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::backend::TableDump;
    use crate::neighbor::NeighborTableStyle;

    pub const REPLY: &str = "1 packets transmitted, 1 received, 0% packet loss\n";
    pub const NO_REPLY: &str = "1 packets transmitted, 0 received, 100% packet loss\n";

    /// Backend returning canned output. Queued answers in `script` are
    /// used first, for any host; after that hosts answer per `replies`,
    /// and unknown hosts error. A missing table makes the query fail.
    #[derive(Default)]
    pub struct FakeBackend {
        pub table: Mutex<Option<String>>,
        pub script: Mutex<VecDeque<bool>>,
        pub replies: Mutex<HashMap<Ipv4Addr, bool>>,
        pub pinged: Mutex<Vec<Ipv4Addr>>,
    }

    impl FakeBackend {
        pub fn with_table(table: &str) -> Self {
            let backend = FakeBackend::default();
            backend.set_table(Some(table));
            backend
        }

        pub fn set_table(&self, table: Option<&str>) {
            *self.table.lock().unwrap() = table.map(str::to_string);
        }

        pub fn set_reply(&self, ip: Ipv4Addr, replies: bool) {
            self.replies.lock().unwrap().insert(ip, replies);
        }

        pub fn queue_replies(&self, replies: &[bool]) {
            self.script.lock().unwrap().extend(replies);
        }

        pub fn pinged(&self) -> Vec<Ipv4Addr> {
            self.pinged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PresenceBackend for FakeBackend {
        async fn query_neighbor_table(&self) -> anyhow::Result<TableDump> {
            let output = self
                .table
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow!("arp: command not found"))?;
            Ok(TableDump {
                style: NeighborTableStyle::IpNeighbor,
                output,
            })
        }

        async fn ping_host(&self, address: Ipv4Addr, _count: u8) -> anyhow::Result<String> {
            self.pinged.lock().unwrap().push(address);
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted.or_else(|| self.replies.lock().unwrap().get(&address).copied()) {
                Some(true) => Ok(REPLY.to_string()),
                Some(false) => Ok(NO_REPLY.to_string()),
                None => Err(anyhow!("ping: exited with status 1")),
            }
        }
    }

    fn device(name: &str, address: Option<[u8; 4]>) -> ResolvedDevice {
        ResolvedDevice {
            name: name.to_string(),
            address: address.map(Ipv4Addr::from),
        }
    }

    #[tokio::test]
    async fn test_get_arp_cache_degrades_to_empty() {
        let backend = FakeBackend::default();
        assert!(get_arp_cache(&backend).await.is_empty());

        backend.set_table(Some("10.0.0.2 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE\n"));
        assert_eq!(get_arp_cache(&backend).await.entries().len(), 1);
    }

    #[test]
    fn test_arp_contains_any() {
        let cache =
            NeighborTableStyle::IpNeighbor.parse("10.0.0.2 dev eth0 lladdr aa:bb:cc:dd:ee:ff STALE\n");

        let present = [device("tablet", None), device("phone", Some([10, 0, 0, 2]))];
        assert!(arp_contains_any(&present, &cache));

        let absent = [device("tablet", None), device("laptop", Some([10, 0, 0, 3]))];
        assert!(!arp_contains_any(&absent, &cache));
        assert!(!arp_contains_any(&present, &ArpCache::default()));
    }

    #[tokio::test]
    async fn test_ping_check_short_circuits_in_order() {
        let backend = FakeBackend::default();
        backend.set_reply(Ipv4Addr::new(10, 0, 0, 2), false);
        backend.set_reply(Ipv4Addr::new(10, 0, 0, 3), true);
        backend.set_reply(Ipv4Addr::new(10, 0, 0, 4), true);

        let devices = [
            device("unresolved", None),
            device("quiet", Some([10, 0, 0, 2])),
            device("phone", Some([10, 0, 0, 3])),
            device("laptop", Some([10, 0, 0, 4])),
        ];
        assert!(ping_check(&backend, &devices, 1, false).await);
        assert_eq!(
            backend.pinged(),
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
        );
    }

    #[tokio::test]
    async fn test_ping_check_errors_count_as_no_reply() {
        let backend = FakeBackend::default();
        backend.set_reply(Ipv4Addr::new(10, 0, 0, 2), false);

        let devices = [
            device("quiet", Some([10, 0, 0, 2])),
            device("erroring", Some([10, 0, 0, 9])),
        ];
        assert!(!ping_check(&backend, &devices, 1, true).await);
        assert_eq!(backend.pinged().len(), 2);
    }
}
