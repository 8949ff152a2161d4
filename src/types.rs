//! Common types for the relay pipeline
//!
//! Provides the database-compatible `Status` enum shared by the processor,
//! the monitors, and the HTTP API.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a bridge request
///
/// Every transfer walks forward through these states; the processor only
/// moves a row with a status-conditioned UPDATE, so a request can never
/// regress or skip a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum Status {
    Detected,
    Claimed,
    Decrypted,
    Transferred,
    Verified,
    Failed,
}

impl Status {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Detected => "detected",
            Status::Claimed => "claimed",
            Status::Decrypted => "decrypted",
            Status::Transferred => "transferred",
            Status::Verified => "verified",
            Status::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Verified | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
