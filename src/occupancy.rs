//! Occupancy state machine.
//!
//! Each probe cycle feeds one observation ("a device was detected" or
//! not) into [`OccupancyState::observe`]. The state is always in exactly
//! one of two runs: an occupied run (`first_seen` set) or a not-seen run
//! (`first_not_seen` set). The externally visible occupancy only drops to
//! vacant once a not-seen run has lasted for the grace period.
//!
//! ```text
//!              observe(false)                elapsed >= grace
//!  Occupied ──────────────────► GracePeriod ──────────────────► Vacant
//!     ▲                             │                              │
//!     │        observe(true)        │                              │
//!     └─────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Before the first observation the state reads as occupied.

use std::time::Duration;

use chrono::{DateTime, Local};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Occupied,
    GracePeriod,
    Vacant,
}

/// A completed run, bounded by the transitions on either side of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl Period {
    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }

    pub fn seconds(&self) -> u64 {
        self.duration().as_secs()
    }
}

#[derive(Clone, Debug)]
pub struct OccupancyState {
    grace_period: Duration,
    first_seen: Option<DateTime<Local>>,
    last_seen: Option<DateTime<Local>>,
    first_not_seen: Option<DateTime<Local>>,
    last_not_seen: Option<DateTime<Local>>,
    /// Time of the first miss while re-confirming an absence. Becomes
    /// `first_not_seen` if the absence is confirmed.
    grace_start: Option<DateTime<Local>>,
    occupied: Option<Period>,
    vacant: Option<Period>,
}

impl OccupancyState {
    pub fn new(grace_period: Duration) -> Self {
        OccupancyState {
            grace_period,
            first_seen: None,
            last_seen: None,
            first_not_seen: None,
            last_not_seen: None,
            grace_start: None,
            occupied: None,
            vacant: None,
        }
    }

    pub fn observe(&mut self, detected: bool, now: DateTime<Local>) {
        if detected {
            self.last_seen = Some(now);
            let first_seen = *self.first_seen.get_or_insert(now);

            if let Some(first_not_seen) = self.first_not_seen.take() {
                self.vacant = Some(Period {
                    start: first_not_seen,
                    end: first_seen,
                });
                self.last_not_seen = None;
            }
            self.grace_start = None;
        } else {
            self.last_not_seen = Some(now);
            let first_not_seen = match self.first_not_seen {
                Some(t) => t,
                None => {
                    let t = self.grace_start.take().unwrap_or(now);
                    self.first_not_seen = Some(t);
                    t
                }
            };

            if let Some(first_seen) = self.first_seen.take() {
                self.occupied = Some(Period {
                    start: first_seen,
                    end: first_not_seen,
                });
                self.last_seen = None;
            }
        }
    }

    /// Record the first miss of a possible absence, before re-confirmation.
    /// Later calls keep the original time.
    pub fn open_grace_window(&mut self, now: DateTime<Local>) {
        self.grace_start.get_or_insert(now);
    }

    /// True unless devices have been missing for at least the grace period.
    pub fn is_occupied(&self, now: DateTime<Local>) -> bool {
        self.phase(now) != Phase::Vacant
    }

    pub fn phase(&self, now: DateTime<Local>) -> Phase {
        match self.first_not_seen {
            None => Phase::Occupied,
            Some(since) => {
                let elapsed = (now - since).to_std().unwrap_or_default();
                if elapsed >= self.grace_period {
                    Phase::Vacant
                } else {
                    Phase::GracePeriod
                }
            }
        }
    }

    /// Devices were detected on the latest observation.
    pub fn devices_seen(&self) -> bool {
        self.first_not_seen.is_none()
    }

    pub fn in_occupied_run(&self) -> bool {
        self.first_seen.is_some()
    }

    /// The last completed occupied run.
    pub fn occupied_period(&self) -> Option<Period> {
        self.occupied
    }

    /// The last completed not-seen run.
    pub fn vacant_period(&self) -> Option<Period> {
        self.vacant
    }

    pub fn first_not_seen(&self) -> Option<DateTime<Local>> {
        self.first_not_seen
    }

    pub fn last_seen(&self) -> Option<DateTime<Local>> {
        self.last_seen
    }

    pub fn last_not_seen(&self) -> Option<DateTime<Local>> {
        self.last_not_seen
    }
}

#[cfg(test)]
impl OccupancyState {
    pub fn first_seen(&self) -> Option<DateTime<Local>> {
        self.first_seen
    }
}
