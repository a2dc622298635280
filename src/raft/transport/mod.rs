//! Transports carry RPCs between Raft servers. The node consumes inbound
//! RPCs from [`Transport::consumer`] and responds to each via its response
//! channel, and sends outbound RPCs via the blocking request methods.

mod memory;
mod tcp;

pub use memory::{Memory, MemoryOptions};
pub use tcp::{Tcp, TcpOptions};

use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse, Rpc, TimeoutNowRequest, TimeoutNowResponse,
};
use super::ServerAddress;
use crate::error::{Error, Result};

use crossbeam::channel::Receiver;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

/// A fast-path handler for heartbeats, called on the transport's own thread.
/// It returns the RPC if it couldn't handle it, in which case the transport
/// delivers it to the consumer as usual.
pub type HeartbeatHandler = Arc<dyn Fn(Rpc) -> Option<Rpc> + Send + Sync>;

/// A network transport. Request methods block until the response arrives or
/// the transport's timeout elapses.
pub trait Transport: Send + Sync {
    /// Returns the channel of inbound RPCs.
    fn consumer(&self) -> Receiver<Rpc>;

    /// Returns the local address, as reachable by peers.
    fn local_addr(&self) -> ServerAddress;

    /// Sends an AppendEntries request.
    fn append_entries(
        &self,
        id: &str,
        target: &str,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Sends a RequestVote request.
    fn request_vote(
        &self,
        id: &str,
        target: &str,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Sends an InstallSnapshot request, followed by exactly `request.size`
    /// bytes of snapshot data.
    fn install_snapshot(
        &self,
        id: &str,
        target: &str,
        request: &InstallSnapshotRequest,
        data: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse>;

    /// Sends a TimeoutNow request.
    fn timeout_now(
        &self,
        id: &str,
        target: &str,
        request: &TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse>;

    /// Opens a pipeline of AppendEntries requests to a peer, if supported.
    fn append_entries_pipeline(&self, _id: &str, _target: &str) -> Result<Box<dyn AppendPipeline>> {
        Err(Error::PipelineReplicationNotSupported)
    }

    /// Encodes a peer address for the wire.
    fn encode_peer(&self, _id: &str, address: &str) -> Vec<u8> {
        address.as_bytes().to_vec()
    }

    /// Decodes a peer address from the wire.
    fn decode_peer(&self, peer: &[u8]) -> ServerAddress {
        String::from_utf8_lossy(peer).into_owned()
    }

    /// Sets or clears the heartbeat fast-path handler.
    fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>);

    /// Closes the transport. Further requests fail.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// The outcome of a pipelined AppendEntries request.
#[derive(Debug)]
pub struct AppendResult {
    /// The request that was sent.
    pub request: AppendEntriesRequest,
    /// The peer's response.
    pub response: Result<AppendEntriesResponse>,
    /// When the request was sent.
    pub started: Instant,
}

/// A pipeline of AppendEntries requests to a single peer. Requests are sent
/// without waiting for previous responses, and results are delivered in
/// order via the consumer channel.
pub trait AppendPipeline: Send {
    /// Sends a request. Blocks if too many requests are in flight.
    fn append_entries(&mut self, request: AppendEntriesRequest) -> Result<()>;

    /// Returns the channel of completed requests.
    fn consumer(&self) -> Receiver<AppendResult>;

    /// Closes the pipeline. Outstanding requests are abandoned.
    fn close(&mut self) -> Result<()>;
}

/// Identifies a peer in transport log messages.
fn peer_name(id: &str, target: &str) -> String {
    if id.is_empty() || id == target {
        target.to_string()
    } else {
        format!("{id} ({target})")
    }
}
