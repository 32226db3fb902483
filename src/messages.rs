use crate::occupancy::Period;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Here,
    Away,
}

impl Presence {
    pub fn from_occupied(occupied: bool) -> Self {
        if occupied { Presence::Here } else { Presence::Away }
    }

    /// Argument passed to the notify command.
    pub fn keyword(self) -> &'static str {
        match self {
            Presence::Here => "here",
            Presence::Away => "away",
        }
    }
}

/// A change in externally visible occupancy, along with the run that just
/// ended (the vacant run when arriving, the occupied run when leaving).
#[derive(Clone, Debug)]
pub struct Transition {
    pub presence: Presence,
    pub prior: Option<Period>,
}

impl Transition {
    pub fn elapsed_seconds(&self) -> u64 {
        self.prior.map(|p| p.seconds()).unwrap_or(0)
    }

    pub fn elapsed(&self) -> String {
        format_elapsed(self.elapsed_seconds())
    }
}

/// `"%dd %02d:%02d:%02d"`
pub fn format_elapsed(secs: u64) -> String {
    format!(
        "{}d {:02}:{:02}:{:02}",
        secs / 86400,
        secs / 3600 % 24,
        secs / 60 % 60,
        secs % 60
    )
}
