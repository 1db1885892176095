//! Job status, kind and operation commands.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::JobServiceError;

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a job.
///
/// Statuses are partially ordered by [`Status::code`]; the final statuses share the
/// highest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Scheduled,
    Running,
    Success,
    Stopped,
    Error,
}

impl Status {
    /// Position in the progression order.
    pub const fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scheduled => 1,
            Self::Running => 2,
            Self::Success | Self::Stopped | Self::Error => 3,
        }
    }

    pub const fn is_final(&self) -> bool {
        self.code() == 3
    }

    /// Statuses a stats record may be created with.
    pub const fn is_initial(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// Compare by progression code only.
    pub fn compare(&self, other: &Status) -> Ordering {
        self.code().cmp(&other.code())
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Scheduled" => Ok(Self::Scheduled),
            "Running" => Ok(Self::Running),
            "Success" => Ok(Self::Success),
            "Stopped" => Ok(Self::Stopped),
            "Error" => Ok(Self::Error),
            other => Err(JobServiceError::invalid_status(other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// How a job was submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Run as soon as a worker is free
    #[default]
    Generic,
    /// Run once after a delay; also every firing of a periodic policy
    Scheduled,
    /// A cron policy spawning scheduled executions
    Periodic,
}

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "Generic",
            Self::Scheduled => "Scheduled",
            Self::Periodic => "Periodic",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Generic" => Ok(Self::Generic),
            "Scheduled" => Ok(Self::Scheduled),
            "Periodic" => Ok(Self::Periodic),
            other => Err(JobServiceError::bad_request(format!("Unknown job kind: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation commands
// ═══════════════════════════════════════════════════════════════════════════════

/// Command a running handler should obey, polled through its execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCommand {
    None,
    Stop,
}

impl OpCommand {
    pub const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl fmt::Display for OpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Stop => f.write_str("stop"),
        }
    }
}
