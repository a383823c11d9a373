//! Job status state machine.
//!
//! Statuses carry a numeric rank used to decide whether an update is newer,
//! older or a duplicate of the stored one:
//!
//! `Pending(0) < Scheduled(1) < Running(2) < {Stopped, Error, Success}(3)`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::JobServiceError;

/// Status of a job in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Accepted and waiting in the ready queue.
    Pending,
    /// Waiting for its run-at time.
    Scheduled,
    /// Picked up by a worker.
    Running,
    /// Stopped on request.
    Stopped,
    /// Run returned an error.
    Error,
    /// Run completed.
    Success,
}

impl Status {
    /// Every known status, in rank order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Scheduled,
        Self::Running,
        Self::Stopped,
        Self::Error,
        Self::Success,
    ];

    /// Rank of the status.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Pending => 0,
            Self::Scheduled => 1,
            Self::Running => 2,
            Self::Stopped | Self::Error | Self::Success => 3,
        }
    }

    /// Rank difference: `> 0` means `self` comes after `other`.
    #[must_use]
    pub const fn compare(self, other: Self) -> i32 {
        self.code() - other.code()
    }

    /// Stopped, Error or Success.
    #[must_use]
    pub const fn is_final(self) -> bool {
        self.code() == 3
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Success => "Success",
        }
    }
}

/// Rank of a raw status string; unknown values map to `-1`.
#[must_use]
pub fn status_code(raw: &str) -> i32 {
    raw.parse::<Status>().map_or(-1, Status::code)
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobServiceError::bad_request(format!("{s} is not valid job status")))
    }
}
