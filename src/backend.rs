use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use log::debug;
use regex::Regex;
use tokio::process::Command;

use crate::neighbor::NeighborTableStyle;

/// Seconds allowed per echo request.
const PING_ATTEMPT_TIMEOUT_SECS: u64 = 1;

static PING_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)received\s*=\s*(\d+)|(\d+)\s+(?:packets\s+)?received").expect("valid regex")
});

static PING_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^.*(?:bytes from|reply from).*ttl=").expect("valid regex"));

static PING_UNREACHABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^.*unreachable").expect("valid regex"));

/// Raw neighbor table output, tagged with the format it is in.
#[derive(Clone, Debug)]
pub struct TableDump {
    pub style: NeighborTableStyle,
    pub output: String,
}

/// The operating-system side of presence detection.
///
/// Both methods hand back raw command output; parsing lives with the
/// callers so it can be exercised with canned strings.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn query_neighbor_table(&self) -> anyhow::Result<TableDump>;

    /// Send `count` echo requests and return everything the command printed.
    /// A non-zero exit is not an error here; the output is still returned.
    async fn ping_host(&self, address: Ipv4Addr, count: u8) -> anyhow::Result<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

pub struct SystemBackend {
    platform: Platform,
    style: NeighborTableStyle,
}

impl SystemBackend {
    /// Pick the neighbor table command once: `arp -a` wherever it runs,
    /// otherwise `ip neighbor list`.
    pub async fn detect() -> Self {
        let platform = Platform::current();
        let style = if platform == Platform::Windows || command_runs("arp", &["-a"]).await {
            NeighborTableStyle::Arp
        } else {
            NeighborTableStyle::IpNeighbor
        };
        debug!("Neighbor table style: {style:?} ({platform:?})");
        SystemBackend { platform, style }
    }

    fn ping_args(&self, address: Ipv4Addr, count: u8) -> Vec<String> {
        let count = count.to_string();
        let mut args = match self.platform {
            Platform::Windows => vec![
                "-n".to_string(),
                count,
                "-w".to_string(),
                (PING_ATTEMPT_TIMEOUT_SECS * 1000).to_string(),
            ],
            Platform::MacOs => vec![
                "-c".to_string(),
                count,
                "-W".to_string(),
                (PING_ATTEMPT_TIMEOUT_SECS * 1000).to_string(),
            ],
            Platform::Linux => vec![
                "-c".to_string(),
                count,
                "-W".to_string(),
                PING_ATTEMPT_TIMEOUT_SECS.to_string(),
            ],
        };
        args.push(address.to_string());
        args
    }
}

async fn command_runs(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[async_trait]
impl PresenceBackend for SystemBackend {
    async fn query_neighbor_table(&self) -> anyhow::Result<TableDump> {
        let mut command = match self.style {
            NeighborTableStyle::Arp => {
                let mut command = Command::new("arp");
                command.arg("-a");
                command
            }
            NeighborTableStyle::IpNeighbor => {
                let mut command = Command::new("ip");
                command.args(["neighbor", "list"]);
                command
            }
        };
        let output = command
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output()
            .await
            .context("running neighbor table command")?;

        if !output.status.success() {
            return Err(anyhow!(
                "neighbor table command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(TableDump {
            style: self.style,
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn ping_host(&self, address: Ipv4Addr, count: u8) -> anyhow::Result<String> {
        let child = Command::new("ping")
            .args(self.ping_args(address, count))
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let deadline = Duration::from_secs(u64::from(count) * PING_ATTEMPT_TIMEOUT_SECS + 2);
        let output = tokio::time::timeout(deadline, child)
            .await
            .with_context(|| format!("ping {address} timed out"))?
            .with_context(|| format!("running ping {address}"))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

/// Number of echo replies reported by ping output. Prefers the statistics
/// summary and falls back to counting reply lines. Windows counts
/// "destination unreachable" answers in `Received = N`, so those are
/// discounted from its summary only. Unparseable output is zero.
pub fn parse_received(output: &str) -> u32 {
    if let Some(caps) = PING_SUMMARY.captures(output) {
        if let Some(windows) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            let unreachable =
                u32::try_from(PING_UNREACHABLE.find_iter(output).count()).unwrap_or(u32::MAX);
            return windows.saturating_sub(unreachable);
        }
        if let Some(posix) = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) {
            return posix;
        }
    }
    u32::try_from(PING_REPLY.find_iter(output).count()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_ping() {
        let reply = "\
PING 192.168.1.20 (192.168.1.20) 56(84) bytes of data.
64 bytes from 192.168.1.20: icmp_seq=1 ttl=64 time=3.21 ms

--- 192.168.1.20 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 3.210/3.210/3.210/0.000 ms
";
        assert_eq!(parse_received(reply), 1);

        let silent = "\
PING 192.168.1.21 (192.168.1.21) 56(84) bytes of data.

--- 192.168.1.21 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";
        assert_eq!(parse_received(silent), 0);

        let unreachable = "\
PING 192.168.1.22 (192.168.1.22) 56(84) bytes of data.
From 192.168.1.5 icmp_seq=1 Destination Host Unreachable

--- 192.168.1.22 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";
        assert_eq!(parse_received(unreachable), 0);

        let partly_unreachable = "\
PING 192.168.1.22 (192.168.1.22) 56(84) bytes of data.
From 192.168.1.5 icmp_seq=1 Destination Host Unreachable
64 bytes from 192.168.1.22: icmp_seq=2 ttl=64 time=2.87 ms

--- 192.168.1.22 ping statistics ---
2 packets transmitted, 1 received, +1 errors, 50% packet loss, time 1001ms
";
        assert_eq!(parse_received(partly_unreachable), 1);
    }

    #[test]
    fn test_parse_macos_ping() {
        let reply = "\
PING 10.0.0.4 (10.0.0.4): 56 data bytes
64 bytes from 10.0.0.4: icmp_seq=0 ttl=64 time=5.123 ms
64 bytes from 10.0.0.4: icmp_seq=1 ttl=64 time=4.456 ms

--- 10.0.0.4 ping statistics ---
2 packets transmitted, 2 packets received, 0.0% packet loss
";
        assert_eq!(parse_received(reply), 2);
    }

    #[test]
    fn test_parse_windows_ping() {
        let reply = "\r\nPinging 192.168.1.20 with 32 bytes of data:\r\n\
Reply from 192.168.1.20: bytes=32 time=3ms TTL=64\r\n\r\n\
Ping statistics for 192.168.1.20:\r\n    \
Packets: Sent = 1, Received = 1, Lost = 0 (0% loss),\r\n";
        assert_eq!(parse_received(reply), 1);

        let unreachable = "\r\nPinging 192.168.1.22 with 32 bytes of data:\r\n\
Reply from 192.168.1.5: Destination host unreachable.\r\n\r\n\
Ping statistics for 192.168.1.22:\r\n    \
Packets: Sent = 1, Received = 1, Lost = 0 (0% loss),\r\n";
        assert_eq!(parse_received(unreachable), 0);
    }

    #[test]
    fn test_parse_reply_lines_without_summary() {
        let truncated = "64 bytes from 10.0.0.4: icmp_seq=0 ttl=64 time=5.123 ms\n";
        assert_eq!(parse_received(truncated), 1);
        assert_eq!(parse_received("ping: unknown host"), 0);
        assert_eq!(parse_received(""), 0);
    }

    #[test]
    fn test_ping_args() {
        let backend = SystemBackend {
            platform: Platform::Linux,
            style: NeighborTableStyle::IpNeighbor,
        };
        assert_eq!(
            backend.ping_args(Ipv4Addr::new(10, 0, 0, 1), 3),
            vec!["-c", "3", "-W", "1", "10.0.0.1"]
        );

        let backend = SystemBackend {
            platform: Platform::Windows,
            style: NeighborTableStyle::Arp,
        };
        assert_eq!(
            backend.ping_args(Ipv4Addr::new(10, 0, 0, 1), 1),
            vec!["-n", "1", "-w", "1000", "10.0.0.1"]
        );
    }
}
