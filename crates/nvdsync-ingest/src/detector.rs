//! Change detection between a feed's remote state and its checkpoint

use chrono::{DateTime, Utc};
use std::fmt;

/// What a feed worker should do with the current remote version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Remote version already imported
    Skip,
    /// Remote version is new; fetch and import it
    Sync,
}

impl ChangeDecision {
    pub fn should_sync(self) -> bool {
        matches!(self, ChangeDecision::Sync)
    }
}

impl fmt::Display for ChangeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeDecision::Skip => write!(f, "skip"),
            ChangeDecision::Sync => write!(f, "sync"),
        }
    }
}

/// Decide whether the remote feed must be imported.
///
/// A feed that was never imported is always synced. Otherwise only a remote
/// instant strictly after the stored one triggers a sync; an equal or older
/// remote (clock skew, mirror lag) is skipped.
pub fn detect(remote: DateTime<Utc>, stored: Option<DateTime<Utc>>) -> ChangeDecision {
    match stored {
        Some(stored) if remote <= stored => ChangeDecision::Skip,
        _ => ChangeDecision::Sync,
    }
}
