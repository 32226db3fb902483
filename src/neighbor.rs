//! Parsing of the operating system's ARP / neighbor table.
//!
//! The table is read by shelling out (see [`crate::backend`]) and the
//! textual output differs per platform:
//!
//! ```text
//! Windows  arp -a    192.168.1.1           00-11-22-33-44-55     dynamic
//! POSIX    arp -a    ? (192.168.1.1) at 0:11:22:33:44:55 on en0 ifscope [ethernet]
//! Linux    ip neigh  192.168.1.1 dev eth0 lladdr 00:11:22:33:44:55 REACHABLE
//! ```
//!
//! Rows without a usable MAC address, IPv6 rows, and rows in a failed or
//! incomplete state are dropped.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use mac_address::MacAddress;
use regex::Regex;

static POSIX_ARP_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d{1,3}(?:\.\d{1,3}){3})\) at (\S+)").expect("valid regex")
});

static WINDOWS_ARP_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,3}(?:\.\d{1,3}){3})\s+([0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5})\s+(\w+)")
        .expect("valid regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Permanent,
    NoArp,
    Dynamic,
    Static,
    Failed,
    Incomplete,
    Invalid,
}

impl NeighborState {
    fn from_keyword(keyword: &str) -> Option<Self> {
        let state = match keyword.to_ascii_uppercase().as_str() {
            "REACHABLE" => NeighborState::Reachable,
            "STALE" => NeighborState::Stale,
            "DELAY" => NeighborState::Delay,
            "PROBE" => NeighborState::Probe,
            "PERMANENT" => NeighborState::Permanent,
            "NOARP" => NeighborState::NoArp,
            "DYNAMIC" => NeighborState::Dynamic,
            "STATIC" => NeighborState::Static,
            "FAILED" => NeighborState::Failed,
            "INCOMPLETE" => NeighborState::Incomplete,
            "INVALID" => NeighborState::Invalid,
            _ => return None,
        };
        Some(state)
    }

    pub fn is_resolved(self) -> bool {
        !matches!(
            self,
            NeighborState::Failed | NeighborState::Incomplete | NeighborState::Invalid
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub state: NeighborState,
}

/// Which command's output format to parse. Chosen once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborTableStyle {
    /// `arp -a`, in either the Windows columnar or the POSIX parenthesised form.
    Arp,
    /// `ip neighbor list`
    IpNeighbor,
}

impl NeighborTableStyle {
    pub fn parse(self, output: &str) -> ArpCache {
        let entries = output
            .lines()
            .filter_map(|line| match self {
                NeighborTableStyle::Arp => parse_arp_line(line),
                NeighborTableStyle::IpNeighbor => parse_ip_neighbor_line(line),
            })
            .filter(|entry| entry.state.is_resolved())
            .collect();
        ArpCache { entries }
    }
}

fn parse_arp_line(line: &str) -> Option<ArpEntry> {
    if let Some(caps) = WINDOWS_ARP_ROW.captures(line) {
        return Some(ArpEntry {
            ip: caps[1].parse().ok()?,
            mac: parse_mac(&caps[2])?,
            state: NeighborState::from_keyword(&caps[3])?,
        });
    }

    let caps = POSIX_ARP_ROW.captures(line)?;
    // "<incomplete>" / "(incomplete)" never parse as a MAC
    let mac = parse_mac(&caps[2])?;
    let state = if line.contains("permanent") {
        NeighborState::Permanent
    } else {
        NeighborState::Dynamic
    };
    Some(ArpEntry {
        ip: caps[1].parse().ok()?,
        mac,
        state,
    })
}

fn parse_ip_neighbor_line(line: &str) -> Option<ArpEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let ip = fields.first()?.parse().ok()?;
    let state = NeighborState::from_keyword(fields.last()?)?;
    let mac = fields
        .iter()
        .position(|f| *f == "lladdr")
        .and_then(|i| fields.get(i + 1))
        .and_then(|m| parse_mac(m))?;
    Some(ArpEntry { mac, ip, state })
}

/// Parse a MAC written with `:` or `-` separators. Octets may be a single
/// hex digit, as macOS prints them, and are padded before handing the text
/// to [`MacAddress`]'s own parser.
pub fn parse_mac(text: &str) -> Option<MacAddress> {
    let octets: Vec<&str> = text.split([':', '-']).collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.is_empty() || o.len() > 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    let padded: Vec<String> = octets.iter().map(|o| format!("{o:0>2}")).collect();
    padded.join(":").parse::<MacAddress>().ok()
}

/// Snapshot of the resolved entries in the neighbor table for one cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub fn entries(&self) -> &[ArpEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|e| e.ip == ip)
    }

    pub fn ip_for_mac(&self, mac: MacAddress) -> Option<Ipv4Addr> {
        self.entries.iter().find(|e| e.mac == mac).map(|e| e.ip)
    }

    pub fn mac_for_ip(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.entries.iter().find(|e| e.ip == ip).map(|e| e.mac)
    }
}
