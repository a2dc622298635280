//! Implements the Raft distributed consensus protocol.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! A [`Raft`] node replicates an ordered log of opaque commands across a
//! cluster of servers, and applies committed commands in log order to an
//! application-defined state machine (the [`State`] trait, often called the
//! FSM). As long as a majority (quorum) of voters is available, the cluster
//! elects a leader, accepts writes, and never loses a committed write.
//!
//! THREADS
//! =======
//!
//! A node runs a handful of cooperating threads, all driven by crossbeam
//! channels:
//!
//! * The main loop owns the role (follower, candidate or leader), the
//!   cluster configurations, and the leader's inflight writes. Every role
//!   change happens here. It never performs RPCs or calls the FSM itself.
//!
//! * The FSM runner applies committed entries and restores snapshots, one
//!   request at a time, so apply and restore are never concurrent.
//!
//! * The snapshot runner periodically snapshots the FSM and compacts the log.
//!
//! * While leader, each peer gets a replication worker that sends
//!   AppendEntries (optionally pipelined) and InstallSnapshot requests, plus
//!   a heartbeat thread. Workers report progress via the commitment tracker,
//!   which signals the main loop when the commit index advances.
//!
//! Threads share a small amount of state via atomics and fine-grained locks
//! (see `node::Shared`): the current term, commit and applied indexes, last
//! log and snapshot positions, the known leader, and the last contact time.
//!
//! ELECTIONS
//! =========
//!
//! Followers that don't hear from a leader within a randomized heartbeat
//! timeout become candidates, increment the term, vote for themselves, and
//! request votes from all voters. The current term and vote are persisted in
//! the stable store before any vote is granted, so a server never votes for
//! two candidates in the same term, even across restarts. A candidate with a
//! quorum of votes becomes leader and immediately appends a no-op entry to
//! commit entries from earlier terms.
//!
//! MEMBERSHIP
//! ==========
//!
//! The cluster configuration is itself replicated as configuration log
//! entries, each carrying the full next configuration. Servers use the latest
//! configuration in their log as soon as it's appended, committed or not. To
//! keep this safe, at most one configuration entry may be uncommitted at a
//! time: the leader only accepts a change once the previous one committed and
//! it has committed an entry in its own term.
//!
//! SNAPSHOTS
//! =========
//!
//! Snapshots capture the FSM state at an index, along with the configuration
//! at that index, and allow the log prefix to be discarded (keeping
//! `trailing_logs` entries for slow followers). Followers that fall behind the
//! leader's log are sent the latest snapshot via InstallSnapshot.

mod api;
mod bootstrap;
mod commitment;
mod config;
mod configuration;
mod fsm;
mod future;
mod log;
mod message;
mod node;
mod observer;
mod replication;
mod snapshot;
mod state;
pub mod transport;

pub use api::{Raft, Stats};
pub use bootstrap::{bootstrap_cluster, has_existing_state, recover_cluster};
pub use config::{Config, ReloadableConfig};
pub use configuration::{
    decode_peers, encode_peers, next_configuration, ChangeCommand, Configuration,
    ConfigurationChange, Configurations, Server, ServerAddress, ServerID, Suffrage,
};
pub use future::{Applied, ApplyFuture, Future};
pub use log::{Entry, EntryKind, Index, Term};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Header, InstallSnapshotRequest,
    InstallSnapshotResponse, Request, RequestVoteRequest, RequestVoteResponse, Response, Rpc,
    TimeoutNowRequest, TimeoutNowResponse,
};
pub use node::Role;
pub use observer::{Observation, ObservationFilter, Observer};
pub use snapshot::OpenSnapshot;
pub use state::{BatchingState, ConfigurationStore, Snapshot, State};
pub use transport::{AppendPipeline, AppendResult, HeartbeatHandler, Transport};

/// The minimum protocol version understood on the wire.
pub const PROTOCOL_VERSION_MIN: u8 = 0;

/// The maximum (current) protocol version.
pub const PROTOCOL_VERSION_MAX: u8 = 3;

/// The minimum snapshot version understood.
pub const SNAPSHOT_VERSION_MIN: u8 = 0;

/// The maximum (current) snapshot version.
pub const SNAPSHOT_VERSION_MAX: u8 = 1;

/// Stable store key holding the current term.
const KEY_CURRENT_TERM: &[u8] = b"CurrentTerm";

/// Stable store key holding the term of the last vote.
const KEY_LAST_VOTE_TERM: &[u8] = b"LastVoteTerm";

/// Stable store key holding the candidate of the last vote.
const KEY_LAST_VOTE_CAND: &[u8] = b"LastVoteCand";

/// Returns the snapshot version to write for a protocol version. Both
/// snapshot versions are readable by all supported protocols.
fn snapshot_version(_protocol_version: u8) -> u8 {
    1
}
