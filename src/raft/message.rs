use super::{Entry, Index, Term};
use crate::encoding;
use crate::errdata;
use crate::error::Result;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// The header carried by every RPC request and response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// The sender's protocol version.
    pub protocol_version: u8,
    /// The sender's server ID.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    /// The sender's transport-encoded address.
    #[serde(with = "serde_bytes")]
    pub addr: Vec<u8>,
}

/// Replicates log entries from a leader to a follower. An empty request with
/// zeroed log positions is a heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub header: Header,
    /// The leader's term.
    pub term: Term,
    /// The leader's transport-encoded address.
    #[serde(with = "serde_bytes")]
    pub leader: Vec<u8>,
    /// The index of the entry immediately preceding the new entries.
    pub prev_log_entry: Index,
    /// The term of the entry immediately preceding the new entries.
    pub prev_log_term: Term,
    /// The entries to append.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit_index: Index,
}

impl AppendEntriesRequest {
    /// Returns true if the request is a heartbeat, which can be handled
    /// without touching the log.
    pub fn is_heartbeat(&self) -> bool {
        self.term != 0
            && !self.leader.is_empty()
            && self.prev_log_entry == 0
            && self.prev_log_term == 0
            && self.entries.is_empty()
            && self.leader_commit_index == 0
    }
}

/// The response to an AppendEntriesRequest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub header: Header,
    /// The receiver's current term, for the leader to step down if newer.
    pub term: Term,
    /// The receiver's last log index, as a hint for the leader's next index.
    pub last_log: Index,
    /// Whether the entries were appended.
    pub success: bool,
    /// Rejections due to log inconsistencies don't warrant backoff.
    pub no_retry_backoff: bool,
}

/// Solicits a vote from a peer in an election.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub header: Header,
    /// The candidate's term.
    pub term: Term,
    /// The candidate's transport-encoded address.
    #[serde(with = "serde_bytes")]
    pub candidate: Vec<u8>,
    /// The candidate's last log index.
    pub last_log_index: Index,
    /// The candidate's last log term.
    pub last_log_term: Term,
    /// Set when the election was triggered by a leadership transfer, which
    /// allows voting even though the receiver knows of a current leader.
    pub leadership_transfer: bool,
}

/// The response to a RequestVoteRequest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub header: Header,
    /// The receiver's current term.
    pub term: Term,
    /// Legacy encoded peers, unused since protocol version 1.
    #[serde(with = "serde_bytes")]
    pub peers: Vec<u8>,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Installs a snapshot on a follower which is too far behind to catch up from
/// the log. The snapshot body of exactly `size` bytes follows the request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub header: Header,
    /// The snapshot format version.
    pub snapshot_version: u8,
    /// The leader's term.
    pub term: Term,
    /// The leader's transport-encoded address.
    #[serde(with = "serde_bytes")]
    pub leader: Vec<u8>,
    /// The last log index included in the snapshot.
    pub last_log_index: Index,
    /// The term of the last log index included in the snapshot.
    pub last_log_term: Term,
    /// Legacy encoded peers, for snapshot version 0.
    #[serde(with = "serde_bytes")]
    pub peers: Vec<u8>,
    /// The encoded cluster configuration as of the snapshot.
    #[serde(with = "serde_bytes")]
    pub configuration: Vec<u8>,
    /// The log index of the configuration.
    pub configuration_index: Index,
    /// The size of the snapshot body in bytes.
    pub size: u64,
}

/// The response to an InstallSnapshotRequest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub header: Header,
    pub term: Term,
    pub success: bool,
}

/// Asks the receiver to start an election immediately, as part of a
/// leadership transfer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub header: Header,
}

/// The response to a TimeoutNowRequest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub header: Header,
}

/// An RPC request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
}

impl encoding::Value for Request {}

impl Request {
    /// Returns the request header.
    pub fn header(&self) -> &Header {
        match self {
            Request::AppendEntries(r) => &r.header,
            Request::RequestVote(r) => &r.header,
            Request::InstallSnapshot(r) => &r.header,
            Request::TimeoutNow(r) => &r.header,
        }
    }
}

/// An RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    TimeoutNow(TimeoutNowResponse),
}

impl encoding::Value for Response {}

impl Response {
    /// Unwraps an AppendEntries response.
    pub fn into_append_entries(self) -> Result<AppendEntriesResponse> {
        match self {
            Response::AppendEntries(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Unwraps a RequestVote response.
    pub fn into_request_vote(self) -> Result<RequestVoteResponse> {
        match self {
            Response::RequestVote(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Unwraps an InstallSnapshot response.
    pub fn into_install_snapshot(self) -> Result<InstallSnapshotResponse> {
        match self {
            Response::InstallSnapshot(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Unwraps a TimeoutNow response.
    pub fn into_timeout_now(self) -> Result<TimeoutNowResponse> {
        match self {
            Response::TimeoutNow(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}

/// An inbound RPC, delivered by the transport to the node. The node must
/// respond exactly once via respond().
pub struct Rpc {
    /// The request.
    pub request: Request,
    /// The snapshot body, for InstallSnapshot requests.
    pub reader: Option<Box<dyn Read + Send>>,
    /// Receives the response.
    pub response_tx: Sender<Result<Response>>,
}

impl Rpc {
    /// Creates a new RPC without a body.
    pub fn new(request: Request, response_tx: Sender<Result<Response>>) -> Self {
        Self { request, reader: None, response_tx }
    }

    /// Sends a response. The caller may have given up on the RPC, so a
    /// disconnected response channel is ignored.
    pub fn respond(self, response: Result<Response>) {
        let _ = self.response_tx.send(response);
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("request", &self.request)
            .field("reader", &self.reader.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_detection() {
        let heartbeat =
            AppendEntriesRequest { term: 3, leader: b"addr".to_vec(), ..Default::default() };
        assert!(heartbeat.is_heartbeat());

        let mut request = heartbeat.clone();
        request.leader_commit_index = 1;
        assert!(!request.is_heartbeat());

        let mut request = heartbeat.clone();
        request.entries.push(Entry::command(vec![1]));
        assert!(!request.is_heartbeat());

        let request = AppendEntriesRequest { term: 3, ..Default::default() };
        assert!(!request.is_heartbeat());
    }
}
