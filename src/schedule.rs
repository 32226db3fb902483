use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Timelike;

use crate::config::OccupiedPolicy;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(TimeOfDay { hour, minute })
    }

    fn seconds_from_midnight(self) -> u64 {
        u64::from(self.hour) * 3600 + u64::from(self.minute) * 60
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTimeOfDay;

impl FromStr for TimeOfDay {
    type Err = InvalidTimeOfDay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s.trim().split_once(':').ok_or(InvalidTimeOfDay)?;
        let hour = hour.parse().map_err(|_| InvalidTimeOfDay)?;
        let minute = minute.parse().map_err(|_| InvalidTimeOfDay)?;
        TimeOfDay::new(hour, minute).ok_or(InvalidTimeOfDay)
    }
}

/// Daily quiet window `[start, end)`. An end before the start wraps past
/// midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffPeak {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl OffPeak {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        OffPeak { start, end }
    }

    /// Seconds until the window closes, if `now` (seconds since midnight)
    /// falls inside it.
    fn remaining(&self, now: u64) -> Option<u64> {
        let start = self.start.seconds_from_midnight();
        let mut end = self.end.seconds_from_midnight();
        if end < start {
            end += DAY_SECS;
        }
        let now = if now < start { now + DAY_SECS } else { now };
        (start..end).contains(&now).then(|| end - now)
    }

    fn until_start(&self, now: u64) -> u64 {
        (self.start.seconds_from_midnight() + DAY_SECS - now) % DAY_SECS
    }
}

impl fmt::Display for OffPeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.start, self.end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepPlan {
    pub duration: Duration,
    pub off_peak: bool,
}

#[derive(Clone, Debug)]
pub struct Scheduler {
    occupied: OccupiedPolicy,
    vacant_sleep: Duration,
    off_peak: Option<OffPeak>,
}

impl Scheduler {
    pub fn new(occupied: OccupiedPolicy, vacant_sleep: Duration, off_peak: Option<OffPeak>) -> Self {
        Scheduler {
            occupied,
            vacant_sleep,
            off_peak,
        }
    }

    /// How long to sleep before the next probe cycle.
    ///
    /// While devices are not being seen the short vacant interval always
    /// applies. Otherwise the occupied policy decides, stretched to the end
    /// of an active off-peak window or cut short so a check lands exactly
    /// when off-peak begins.
    pub fn next_interval<T: Timelike>(&self, now: &T, devices_seen: bool) -> SleepPlan {
        if !devices_seen {
            return SleepPlan {
                duration: self.vacant_sleep,
                off_peak: false,
            };
        }

        let now = u64::from(now.num_seconds_from_midnight());
        let mut secs = match self.occupied {
            OccupiedPolicy::Fixed(interval) => interval.as_secs(),
            OccupiedPolicy::Aligned(minutes) => {
                let period = u64::from(minutes.max(1)) * 60;
                period - now % period
            }
        };

        if let Some(off_peak) = self.off_peak {
            if let Some(remaining) = off_peak.remaining(now) {
                return SleepPlan {
                    duration: Duration::from_secs(remaining),
                    off_peak: true,
                };
            }
            let until_start = off_peak.until_start(now);
            if until_start > 0 && until_start < secs {
                secs = until_start;
            }
        }

        SleepPlan {
            duration: Duration::from_secs(secs),
            off_peak: false,
        }
    }
}

/// `"%dh %02dm %02ds"`, used when logging sleeps.
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, secs / 60 % 60, secs % 60)
}
