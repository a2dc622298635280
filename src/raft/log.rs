use crate::encoding;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A leader term. Starts at 1 once a cluster is bootstrapped, 0 means none.
pub type Term = u64;

/// A log entry type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An application command, applied to the FSM.
    Command,
    /// A no-op, appended by a new leader to commit entries from prior terms
    /// (see section 5.4.2 in the Raft paper), and after a user restore.
    Noop,
    /// A legacy membership change (protocol ≤ 2) carrying encoded peers.
    AddPeerDeprecated,
    /// A legacy membership change (protocol ≤ 2) carrying encoded peers.
    RemovePeerDeprecated,
    /// A fence. It is not applied to the FSM, but its future resolves once
    /// all preceding entries have been applied.
    Barrier,
    /// A full cluster configuration (protocol ≥ 1).
    Configuration,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Command => write!(f, "Command"),
            EntryKind::Noop => write!(f, "Noop"),
            EntryKind::AddPeerDeprecated => write!(f, "AddPeerDeprecated"),
            EntryKind::RemovePeerDeprecated => write!(f, "RemovePeerDeprecated"),
            EntryKind::Barrier => write!(f, "Barrier"),
            EntryKind::Configuration => write!(f, "Configuration"),
        }
    }
}

/// A log entry. Entries are replicated to all servers and, once committed,
/// applied in index order to every server's FSM.
///
/// Index | Term | Kind          | Data
/// ------|------|---------------|-------------------------------
///   1   |   1  | Configuration | {Voter a, Voter b, Voter c}
///   2   |   2  | Noop          |
///   3   |   2  | Command       | set foo=bar
///   4   |   3  | Noop          |
///   5   |   3  | Barrier       |
///
/// An entry is immutable once committed. An uncommitted entry may be replaced
/// by a leader of a later term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The entry type.
    pub kind: EntryKind,
    /// The entry payload. Opaque except for configuration entries.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Opaque application extensions, replicated but never interpreted.
    #[serde(with = "serde_bytes")]
    pub extensions: Vec<u8>,
    /// The leader's wall-clock time when the entry was appended. Informational
    /// only, never used for ordering or replication decisions.
    pub appended_at: Option<SystemTime>,
}

impl encoding::Value for Entry {}

impl Entry {
    /// Creates a new entry of the given kind. The index and term are assigned
    /// by the leader when the entry is dispatched.
    pub fn new(kind: EntryKind, data: Vec<u8>) -> Self {
        Self { index: 0, term: 0, kind, data, extensions: Vec::new(), appended_at: None }
    }

    /// Creates a new command entry.
    pub fn command(data: Vec<u8>) -> Self {
        Self::new(EntryKind::Command, data)
    }
}
