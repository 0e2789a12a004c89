//! The attempt state machine.
//!
//! Every transaction attempt moves through a closed set of states recorded
//! in its ATR entry. The ATR is the single source of truth for an attempt's
//! outcome; document staging xattrs are advisory until cross-checked
//! against it.
//!
//! ```text
//! NothingWritten ──▶ Pending ──▶ Committed ──▶ Completed
//!                       │
//!                       └──────▶ Aborted ────▶ RolledBack
//! ```
//!
//! `Completed` and `RolledBack` are terminal. `Unknown` is the sentinel for
//! unparseable or future states written by newer clients; cleanup treats it
//! as a no-op rather than guessing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one transaction attempt, as recorded in its ATR entry.
///
/// The enum is deliberately closed and matched exhaustively everywhere:
/// introducing a new state forces an explicit decision at every dispatch
/// site instead of silently falling through to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// No ATR entry exists yet; the attempt has staged nothing.
    NothingWritten,
    /// The attempt has staged at least one mutation and may stage more.
    Pending,
    /// The rollback decision was taken; staged changes are being reverted.
    Aborted,
    /// The commit decision was taken; staged changes are being applied.
    Committed,
    /// All documents were unstaged after commit. Terminal.
    Completed,
    /// All staged changes were reverted after abort. Terminal.
    RolledBack,
    /// Unrecognized wire state (newer client, corrupt entry). Treated as a
    /// no-op by cleanup.
    #[serde(other)]
    Unknown,
}

impl AttemptState {
    /// All states, in protocol order. Useful for exhaustive dispatch tests.
    pub const ALL: [AttemptState; 7] = [
        AttemptState::NothingWritten,
        AttemptState::Pending,
        AttemptState::Aborted,
        AttemptState::Committed,
        AttemptState::Completed,
        AttemptState::RolledBack,
        AttemptState::Unknown,
    ];

    /// Returns the wire form stored in the ATR (`"PENDING"`, ...).
    #[must_use]
    pub const fn as_wire_str(&self) -> &'static str {
        match self {
            AttemptState::NothingWritten => "NOTHING_WRITTEN",
            AttemptState::Pending => "PENDING",
            AttemptState::Aborted => "ABORTED",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::RolledBack => "ROLLED_BACK",
            AttemptState::Unknown => "UNKNOWN",
        }
    }

    /// Parses the wire form. Unrecognized strings yield [`AttemptState::Unknown`]
    /// rather than an error, so entries written by future clients never fail
    /// to load.
    #[must_use]
    pub fn parse_wire(s: &str) -> Self {
        match s {
            "NOTHING_WRITTEN" => AttemptState::NothingWritten,
            "PENDING" => AttemptState::Pending,
            "ABORTED" => AttemptState::Aborted,
            "COMMITTED" => AttemptState::Committed,
            "COMPLETED" => AttemptState::Completed,
            "ROLLED_BACK" => AttemptState::RolledBack,
            _ => AttemptState::Unknown,
        }
    }

    /// Returns true for states no attempt ever leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}
