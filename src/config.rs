use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;
use thiserror::Error;

use crate::device::{DeviceKind, MonitoredDevice};
use crate::learning::SubnetPrefix;
use crate::schedule::{OffPeak, TimeOfDay};

pub const DEFAULT_PING_COUNT: u8 = 1;
pub const MAX_PING_COUNT: u8 = 5;
pub const DEFAULT_SEED_WORKERS: usize = 20;
pub const DEFAULT_RECONFIRM_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONFIRM_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_GRACE_MINUTES: u64 = 15;
pub const DEFAULT_OCCUPIED_SLEEP_SECONDS: u64 = 15 * 60;
pub const DEFAULT_VACANT_SLEEP_SECONDS: u64 = 15;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub devices: Vec<String>,
    pub probe: Option<ProbeConfig>,
    pub schedule: Option<ScheduleConfig>,
    pub notify: Option<NotifyConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProbeConfig {
    pub use_arp: Option<bool>,
    pub ping_count: Option<u8>,
    pub reverse_lookup: Option<bool>,
    pub randomize: Option<bool>,
    pub subnet: Option<String>,
    pub seed_workers: Option<usize>,
    pub reconfirm_attempts: Option<u32>,
    pub reconfirm_interval_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScheduleConfig {
    pub grace_minutes: Option<u64>,
    pub off_peak_start: Option<String>,
    pub off_peak_end: Option<String>,
    pub occupied_sleep_seconds: Option<u64>,
    pub check_every_minutes: Option<u32>,
    pub vacant_sleep_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct NotifyConfig {
    pub command: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one device must be configured")]
    NoDevices,
    #[error("device {0:?} looks like a MAC address but cannot be parsed")]
    InvalidMac(String),
    #[error("ping_count must be between 1 and 5, got {0}")]
    PingCount(u8),
    #[error("seed_workers must be at least 1")]
    SeedWorkers,
    #[error("occupied_sleep_seconds and check_every_minutes are mutually exclusive")]
    ConflictingOccupiedPolicy,
    #[error("check_every_minutes must be between 1 and 60, got {0}")]
    CheckEvery(u32),
    #[error("off_peak_start and off_peak_end must be set together")]
    IncompleteOffPeak,
    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTime(String),
    #[error("invalid subnet {0:?}, expected a.b.c or a.b.c.0/24")]
    InvalidSubnet(String),
    #[error("notify command {} does not exist", .0.display())]
    MissingNotifyCommand(PathBuf),
}

/// How the next check is timed while devices are being seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupiedPolicy {
    Fixed(Duration),
    /// Wake on the next wall-clock multiple of this many minutes.
    Aligned(u32),
}

/// Validated, immutable view of [`AppConfig`] handed to the monitor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub devices: Vec<MonitoredDevice>,
    pub use_arp: bool,
    pub ping_count: u8,
    pub reverse_lookup: bool,
    pub randomize: bool,
    pub subnet: Option<SubnetPrefix>,
    pub seed_workers: usize,
    pub reconfirm_attempts: u32,
    pub reconfirm_interval: Duration,
    pub grace_period: Duration,
    pub off_peak: Option<OffPeak>,
    pub occupied: OccupiedPolicy,
    pub vacant_sleep: Duration,
    pub notify_command: Option<PathBuf>,
}

impl Settings {
    pub fn grace_minutes(&self) -> u64 {
        self.grace_period.as_secs() / 60
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let devices = self
            .devices
            .iter()
            .map(|id| {
                let device = MonitoredDevice::new(id.trim());
                match device.kind {
                    DeviceKind::Mac if device.mac().is_none() => {
                        Err(ConfigError::InvalidMac(id.clone()))
                    }
                    _ => Ok(device),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let probe = self.probe.clone().unwrap_or_default();
        let schedule = self.schedule.clone().unwrap_or_default();

        let ping_count = probe.ping_count.unwrap_or(DEFAULT_PING_COUNT);
        if !(1..=MAX_PING_COUNT).contains(&ping_count) {
            return Err(ConfigError::PingCount(ping_count));
        }

        let seed_workers = probe.seed_workers.unwrap_or(DEFAULT_SEED_WORKERS);
        if seed_workers == 0 {
            return Err(ConfigError::SeedWorkers);
        }

        let subnet = probe
            .subnet
            .as_deref()
            .map(|s| s.parse::<SubnetPrefix>().map_err(|_| ConfigError::InvalidSubnet(s.into())))
            .transpose()?;

        let occupied = match (schedule.occupied_sleep_seconds, schedule.check_every_minutes) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingOccupiedPolicy),
            (_, Some(minutes)) if !(1..=60).contains(&minutes) => {
                return Err(ConfigError::CheckEvery(minutes));
            }
            (_, Some(minutes)) => OccupiedPolicy::Aligned(minutes),
            (secs, None) => OccupiedPolicy::Fixed(Duration::from_secs(
                secs.unwrap_or(DEFAULT_OCCUPIED_SLEEP_SECONDS),
            )),
        };

        let off_peak = match (&schedule.off_peak_start, &schedule.off_peak_end) {
            (None, None) => None,
            (Some(start), Some(end)) => Some(OffPeak::new(parse_time(start)?, parse_time(end)?)),
            _ => return Err(ConfigError::IncompleteOffPeak),
        };

        let notify_command = self.notify.as_ref().and_then(|n| n.command.clone());
        if let Some(command) = &notify_command {
            if !command.exists() {
                return Err(ConfigError::MissingNotifyCommand(command.clone()));
            }
        }

        Ok(Settings {
            devices,
            use_arp: probe.use_arp.unwrap_or(true),
            ping_count,
            reverse_lookup: probe.reverse_lookup.unwrap_or(true),
            randomize: probe.randomize.unwrap_or(true),
            subnet,
            seed_workers,
            reconfirm_attempts: probe.reconfirm_attempts.unwrap_or(DEFAULT_RECONFIRM_ATTEMPTS),
            reconfirm_interval: Duration::from_secs(
                probe
                    .reconfirm_interval_seconds
                    .unwrap_or(DEFAULT_RECONFIRM_INTERVAL_SECONDS),
            ),
            grace_period: Duration::from_secs(
                schedule.grace_minutes.unwrap_or(DEFAULT_GRACE_MINUTES) * 60,
            ),
            off_peak,
            occupied,
            vacant_sleep: Duration::from_secs(
                schedule
                    .vacant_sleep_seconds
                    .unwrap_or(DEFAULT_VACANT_SLEEP_SECONDS),
            ),
            notify_command,
        })
    }
}

fn parse_time(value: &str) -> Result<TimeOfDay, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))
}
