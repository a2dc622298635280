use super::{ServerID, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use crate::errinput;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raft node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The protocol version to speak. Versions below 3 exist only to migrate
    /// clusters from legacy address-based membership.
    pub protocol_version: u8,
    /// How long a follower waits without leader contact before becoming a
    /// candidate. Randomized in [T, 2T).
    pub heartbeat_timeout: Duration,
    /// How long a candidate waits for an election result before starting a
    /// new one. Randomized in [T, 2T).
    pub election_timeout: Duration,
    /// How long replication may idle before a follower is sent the leader's
    /// commit index.
    pub commit_timeout: Duration,
    /// The maximum number of entries per AppendEntries request and per
    /// group commit.
    pub max_append_entries: usize,
    /// Buffers the apply channel to max_append_entries, allowing client
    /// applies to queue up while the leader is busy.
    pub batch_apply_ch: bool,
    /// Shut down the node when it is removed from the cluster, rather than
    /// staying as a leaderless follower.
    pub shutdown_on_remove: bool,
    /// The number of log entries to keep after a snapshot, so that slow
    /// followers can catch up from the log instead of a snapshot.
    pub trailing_logs: u64,
    /// How often to check whether a snapshot should be taken. Randomized in
    /// [T, 2T).
    pub snapshot_interval: Duration,
    /// The number of new committed entries required before a snapshot is taken.
    pub snapshot_threshold: u64,
    /// The leader steps down if it hasn't heard from a quorum within this
    /// duration.
    pub leader_lease_timeout: Duration,
    /// The local server ID.
    pub local_id: ServerID,
    /// Skip restoring the newest snapshot into the FSM on startup.
    pub no_snapshot_restore_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_MAX,
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1000),
            commit_timeout: Duration::from_millis(50),
            max_append_entries: 64,
            batch_apply_ch: false,
            shutdown_on_remove: true,
            trailing_logs: 10240,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
            leader_lease_timeout: Duration::from_millis(500),
            local_id: ServerID::new(),
            no_snapshot_restore_on_start: false,
        }
    }
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        // Version 0 is understood on the wire but can't be run.
        let protocol_min = PROTOCOL_VERSION_MIN.max(1);
        if self.protocol_version < protocol_min || self.protocol_version > PROTOCOL_VERSION_MAX {
            return errinput!(
                "protocol version {} must be >= {protocol_min} and <= {PROTOCOL_VERSION_MAX}",
                self.protocol_version
            );
        }
        if self.local_id.is_empty() {
            return errinput!("local ID cannot be empty");
        }
        if self.heartbeat_timeout < Duration::from_millis(5) {
            return errinput!("heartbeat timeout is too low");
        }
        if self.election_timeout < Duration::from_millis(5) {
            return errinput!("election timeout is too low");
        }
        if self.commit_timeout < Duration::from_millis(1) {
            return errinput!("commit timeout is too low");
        }
        if self.max_append_entries == 0 {
            return errinput!("max append entries must be positive");
        }
        if self.max_append_entries > 1024 {
            return errinput!("max append entries is too large");
        }
        if self.snapshot_interval < Duration::from_millis(5) {
            return errinput!("snapshot interval is too low");
        }
        if self.leader_lease_timeout < Duration::from_millis(5) {
            return errinput!("leader lease timeout is too low");
        }
        if self.leader_lease_timeout > self.heartbeat_timeout {
            return errinput!(
                "leader lease timeout ({:?}) cannot be larger than heartbeat timeout ({:?})",
                self.leader_lease_timeout,
                self.heartbeat_timeout
            );
        }
        if self.election_timeout < self.heartbeat_timeout {
            return errinput!(
                "election timeout ({:?}) must be equal or greater than heartbeat timeout ({:?})",
                self.election_timeout,
                self.heartbeat_timeout
            );
        }
        Ok(())
    }

    /// Returns the reloadable subset of the configuration.
    pub fn reloadable(&self) -> ReloadableConfig {
        ReloadableConfig {
            trailing_logs: self.trailing_logs,
            snapshot_interval: self.snapshot_interval,
            snapshot_threshold: self.snapshot_threshold,
        }
    }

    /// Returns a copy of the configuration with the reloadable fields
    /// replaced.
    pub fn merge(&self, reloadable: &ReloadableConfig) -> Self {
        Self {
            trailing_logs: reloadable.trailing_logs,
            snapshot_interval: reloadable.snapshot_interval,
            snapshot_threshold: reloadable.snapshot_threshold,
            ..self.clone()
        }
    }
}

/// The subset of Config that can be changed on a running node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReloadableConfig {
    pub trailing_logs: u64,
    pub snapshot_interval: Duration,
    pub snapshot_threshold: u64,
}
