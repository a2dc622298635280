use super::{AppendPipeline, AppendResult, HeartbeatHandler, Transport};
use crate::error::{Error, Result};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Request, RequestVoteRequest, RequestVoteResponse, Response, Rpc, TimeoutNowRequest,
    TimeoutNowResponse,
};
use crate::raft::ServerAddress;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use log::debug;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// The capacity of the inbound RPC channel.
const CONSUMER_CAPACITY: usize = 16;

/// Options for an in-memory transport.
#[derive(Clone, Debug)]
pub struct MemoryOptions {
    /// The RPC timeout.
    pub timeout: Duration,
    /// The maximum number of pipelined AppendEntries requests in flight per
    /// peer. Pipelining is disabled below 2.
    pub max_rpcs_in_flight: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(500), max_rpcs_in_flight: 128 }
    }
}

/// Closes a pipeline when the sender is dropped.
type Closer = Arc<Mutex<Option<Sender<()>>>>;

/// An in-process transport, for tests and embedded clusters. Transports are
/// wired together explicitly via connect(), and can be partitioned via
/// disconnect(). Connections are one-way: a.connect(&b) lets a send to b.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<Inner>,
}

struct Inner {
    addr: ServerAddress,
    consumer_tx: Sender<Rpc>,
    consumer_rx: Receiver<Rpc>,
    peers: RwLock<HashMap<ServerAddress, Memory>>,
    pipelines: Mutex<Vec<(ServerAddress, Closer)>>,
    heartbeat: RwLock<Option<HeartbeatHandler>>,
    options: MemoryOptions,
}

impl Memory {
    /// Creates a transport with the given address, or a random one if empty.
    pub fn new(addr: impl Into<ServerAddress>) -> Self {
        Self::with_options(addr, MemoryOptions::default())
    }

    /// Creates a transport with the given options.
    pub fn with_options(addr: impl Into<ServerAddress>, options: MemoryOptions) -> Self {
        let mut addr = addr.into();
        if addr.is_empty() {
            addr = uuid::Uuid::new_v4().to_string();
        }
        let (consumer_tx, consumer_rx) = crossbeam::channel::bounded(CONSUMER_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                addr,
                consumer_tx,
                consumer_rx,
                peers: RwLock::new(HashMap::new()),
                pipelines: Mutex::new(Vec::new()),
                heartbeat: RwLock::new(None),
                options,
            }),
        }
    }

    /// Allows this transport to send to the given peer.
    pub fn connect(&self, peer: &Memory) -> Result<()> {
        self.inner.peers.write()?.insert(peer.inner.addr.clone(), peer.clone());
        Ok(())
    }

    /// Removes the route to a peer, closing any pipelines to it.
    pub fn disconnect(&self, addr: &str) -> Result<()> {
        self.inner.peers.write()?.remove(addr);
        let mut pipelines = self.inner.pipelines.lock()?;
        for (_, closer) in pipelines.iter().filter(|(target, _)| target == addr) {
            closer.lock()?.take();
        }
        pipelines.retain(|(target, _)| target != addr);
        Ok(())
    }

    /// Removes all routes, closing all pipelines.
    pub fn disconnect_all(&self) -> Result<()> {
        self.inner.peers.write()?.clear();
        for (_, closer) in self.inner.pipelines.lock()?.drain(..) {
            closer.lock()?.take();
        }
        Ok(())
    }

    /// Looks up a connected peer.
    fn peer(&self, target: &str) -> Result<Memory> {
        self.inner
            .peers
            .read()?
            .get(target)
            .cloned()
            .ok_or_else(|| Error::IO(format!("failed to connect to peer: {target}")))
    }

    /// Delivers an inbound RPC to this transport, via the heartbeat handler
    /// if it accepts the RPC.
    fn deliver(&self, rpc: Rpc, timeout: Duration) -> Result<()> {
        let heartbeat = matches!(&rpc.request, Request::AppendEntries(r) if r.is_heartbeat());
        let mut rpc = rpc;
        if heartbeat {
            let handler = self.inner.heartbeat.read()?.clone();
            if let Some(handler) = handler {
                match handler(rpc) {
                    Some(unhandled) => rpc = unhandled,
                    None => return Ok(()),
                }
            }
        }
        self.inner
            .consumer_tx
            .send_timeout(rpc, timeout)
            .map_err(|_| Error::IO(format!("send to {} timed out", self.inner.addr)))
    }

    /// Sends a request to a peer and waits for the response.
    fn request(
        &self,
        target: &str,
        request: Request,
        reader: Option<Box<dyn Read + Send>>,
        timeout: Duration,
    ) -> Result<Response> {
        let peer = self.peer(target)?;
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        peer.deliver(Rpc { request, reader, response_tx }, timeout)?;
        match response_rx.recv_timeout(timeout) {
            Ok(response) => response,
            Err(_) => Err(Error::IO(format!("request to {target} timed out"))),
        }
    }
}

impl Transport for Memory {
    fn consumer(&self) -> Receiver<Rpc> {
        self.inner.consumer_rx.clone()
    }

    fn local_addr(&self) -> ServerAddress {
        self.inner.addr.clone()
    }

    fn append_entries(
        &self,
        _id: &str,
        target: &str,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let request = Request::AppendEntries(request.clone());
        self.request(target, request, None, self.inner.options.timeout)?.into_append_entries()
    }

    fn request_vote(
        &self,
        _id: &str,
        target: &str,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let request = Request::RequestVote(request.clone());
        self.request(target, request, None, self.inner.options.timeout)?.into_request_vote()
    }

    fn install_snapshot(
        &self,
        _id: &str,
        target: &str,
        request: &InstallSnapshotRequest,
        data: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse> {
        // Snapshots take a while to install, so allow more time.
        let request = Request::InstallSnapshot(request.clone());
        self.request(target, request, Some(data), 10 * self.inner.options.timeout)?.into_install_snapshot()
    }

    fn timeout_now(
        &self,
        _id: &str,
        target: &str,
        request: &TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        let request = Request::TimeoutNow(request.clone());
        self.request(target, request, None, self.inner.options.timeout)?.into_timeout_now()
    }

    fn append_entries_pipeline(&self, _id: &str, target: &str) -> Result<Box<dyn AppendPipeline>> {
        let max_in_flight = self.inner.options.max_rpcs_in_flight;
        if max_in_flight < 2 {
            return Err(Error::PipelineReplicationNotSupported);
        }
        let pipeline =
            MemoryPipeline::new(self.peer(target)?, self.inner.options.timeout, max_in_flight);
        self.inner.pipelines.lock()?.push((target.to_string(), pipeline.closer.clone()));
        debug!("Opened pipeline from {} to {target}", self.inner.addr);
        Ok(Box::new(pipeline))
    }

    fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>) {
        match self.inner.heartbeat.write() {
            Ok(mut heartbeat) => *heartbeat = handler,
            Err(err) => log::error!("Failed to set heartbeat handler: {err}"),
        }
    }

    fn close(&self) -> Result<()> {
        self.disconnect_all()
    }
}

/// A request awaiting its response in a pipeline.
struct Inflight {
    request: AppendEntriesRequest,
    response_rx: Receiver<Result<Response>>,
    started: Instant,
}

/// An in-memory AppendEntries pipeline. Requests are delivered to the peer
/// immediately, and a decoder thread waits for the responses in order.
struct MemoryPipeline {
    peer: Memory,
    timeout: Duration,
    inflight_tx: Sender<Inflight>,
    done_rx: Receiver<AppendResult>,
    closer: Closer,
    shutdown_rx: Receiver<()>,
}

impl MemoryPipeline {
    fn new(peer: Memory, timeout: Duration, max_in_flight: usize) -> Self {
        // The decoder thread holds one more request while awaiting its response.
        let (inflight_tx, inflight_rx) = crossbeam::channel::bounded(max_in_flight - 1);
        let (done_tx, done_rx) = crossbeam::channel::bounded(max_in_flight - 1);
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
        let decoder_shutdown_rx = shutdown_rx.clone();
        std::thread::spawn(move || Self::decode(inflight_rx, done_tx, decoder_shutdown_rx, timeout));
        Self {
            peer,
            timeout,
            inflight_tx,
            done_rx,
            closer: Arc::new(Mutex::new(Some(shutdown_tx))),
            shutdown_rx,
        }
    }

    /// Waits for responses to in-flight requests, in order.
    fn decode(
        inflight_rx: Receiver<Inflight>,
        done_tx: Sender<AppendResult>,
        shutdown_rx: Receiver<()>,
        timeout: Duration,
    ) {
        loop {
            let inflight = crossbeam::select! {
                recv(inflight_rx) -> inflight => match inflight {
                    Ok(inflight) => inflight,
                    Err(_) => return,
                },
                recv(shutdown_rx) -> _ => return,
            };
            let response = crossbeam::select! {
                recv(inflight.response_rx) -> response => match response {
                    Ok(response) => response.and_then(|r| r.into_append_entries()),
                    Err(_) => Err(Error::IO("peer dropped pipelined request".into())),
                },
                recv(crossbeam::channel::after(timeout)) -> _ => {
                    Err(Error::IO("pipelined request timed out".into()))
                },
                recv(shutdown_rx) -> _ => return,
            };
            let result =
                AppendResult { request: inflight.request, response, started: inflight.started };
            crossbeam::select! {
                send(done_tx, result) -> sent => if sent.is_err() { return },
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl AppendPipeline for MemoryPipeline {
    fn append_entries(&mut self, request: AppendEntriesRequest) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PipelineShutdown);
        }
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        let started = Instant::now();
        let rpc = Rpc::new(Request::AppendEntries(request.clone()), response_tx);
        self.peer.deliver(rpc, self.timeout)?;
        let inflight = Inflight { request, response_rx, started };
        crossbeam::select! {
            send(self.inflight_tx, inflight) -> sent => sent.map_err(|_| Error::PipelineShutdown),
            recv(self.shutdown_rx) -> _ => Err(Error::PipelineShutdown),
        }
    }

    fn consumer(&self) -> Receiver<AppendResult> {
        self.done_rx.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.closer.lock()?.take();
        Ok(())
    }
}

impl Drop for MemoryPipeline {
    fn drop(&mut self) {
        if let Ok(mut closer) = self.closer.lock() {
            closer.take();
        }
    }
}
