use super::{peer_name, AppendPipeline, AppendResult, HeartbeatHandler, Transport};
use crate::encoding::Value as _;
use crate::errinput;
use crate::error::{Error, Result};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Request, RequestVoteRequest, RequestVoteResponse, Response, Rpc, TimeoutNowRequest,
    TimeoutNowResponse,
};
use crate::raft::ServerAddress;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// The capacity of the inbound RPC channel.
const CONSUMER_CAPACITY: usize = 16;

/// InstallSnapshot timeouts are scaled by the snapshot size in these units.
const SNAPSHOT_TIMEOUT_UNIT: u64 = 256 * 1024;

/// TCP transport options.
#[derive(Clone, Debug)]
pub struct TcpOptions {
    /// The address peers use to reach this server. Defaults to the listener's
    /// local address, which must then be a specific IP.
    pub advertise: Option<ServerAddress>,
    /// The number of idle outbound connections to keep per peer.
    pub max_pool: usize,
    /// The IO timeout for requests. InstallSnapshot scales it by size.
    pub timeout: Duration,
    /// The maximum number of pipelined AppendEntries requests in flight per
    /// peer. Pipelining is disabled below 2.
    pub max_rpcs_in_flight: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            advertise: None,
            max_pool: 3,
            timeout: Duration::from_secs(10),
            max_rpcs_in_flight: 2,
        }
    }
}

/// A TCP transport. Each request is a Bincode-encoded Request, followed by
/// the raw snapshot body for InstallSnapshot, and each response is a
/// Bincode-encoded Result<Response>. Connections serve requests sequentially,
/// so responses arrive in request order which allows pipelining.
#[derive(Clone)]
pub struct Tcp {
    inner: Arc<Inner>,
}

struct Inner {
    addr: ServerAddress,
    listen_addr: SocketAddr,
    options: TcpOptions,
    consumer_tx: Sender<Rpc>,
    consumer_rx: Receiver<Rpc>,
    heartbeat: RwLock<Option<HeartbeatHandler>>,
    pool: Mutex<HashMap<ServerAddress, Vec<Conn>>>,
    shutdown: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Tcp {
    /// Binds a listener to the given address and creates a transport.
    pub fn bind(addr: &str, options: TcpOptions) -> Result<Self> {
        Self::new(TcpListener::bind(addr)?, options)
    }

    /// Creates a transport serving inbound requests from the listener.
    pub fn new(listener: TcpListener, options: TcpOptions) -> Result<Self> {
        let listen_addr = listener.local_addr()?;
        let addr = match &options.advertise {
            Some(advertise) => advertise.clone(),
            None if listen_addr.ip().is_unspecified() => {
                return errinput!("listen address {listen_addr} is not advertisable");
            }
            None => listen_addr.to_string(),
        };
        if options.timeout.is_zero() {
            return errinput!("transport timeout must be positive");
        }
        let (consumer_tx, consumer_rx) = crossbeam::channel::bounded(CONSUMER_CAPACITY);
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
        let inner = Arc::new(Inner {
            addr,
            listen_addr,
            options,
            consumer_tx,
            consumer_rx,
            heartbeat: RwLock::new(None),
            pool: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        });
        let listen_inner = inner.clone();
        std::thread::spawn(move || listen_inner.listen(listener));
        debug!("Listening for Raft peers on {listen_addr}");
        Ok(Self { inner })
    }

    /// Fetches a pooled connection to the target, or dials a new one.
    fn conn(&self, id: &str, target: &str) -> Result<Conn> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::TransportShutdown);
        }
        if let Some(conn) = self.inner.pool.lock()?.get_mut(target).and_then(|conns| conns.pop()) {
            return Ok(conn);
        }
        debug!("Connecting to Raft peer {}", peer_name(id, target));
        Conn::dial(target, self.inner.options.timeout)
    }

    /// Returns a healthy connection to the pool.
    fn release(&self, conn: Conn) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut pool) = self.inner.pool.lock() {
            let conns = pool.entry(conn.target.clone()).or_default();
            if conns.len() < self.inner.options.max_pool {
                conns.push(conn);
            }
        }
    }

    /// Sends a request via a pooled connection and waits for the response.
    fn request(&self, id: &str, target: &str, request: Request) -> Result<Response> {
        let mut conn = self.conn(id, target)?;
        conn.set_timeout(self.inner.options.timeout)?;
        conn.send(&request)?;
        let response = conn.receive()?;
        self.release(conn);
        response
    }
}

impl Inner {
    /// Accepts inbound connections until shutdown.
    fn listen(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("Raft peer connection failed: {err}");
                    continue;
                }
            };
            let inner = self.clone();
            std::thread::spawn(move || {
                let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                debug!("Raft peer {peer} connected");
                match inner.serve(stream) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => warn!("Raft peer {peer} error: {err}"),
                }
            });
        }
        debug!("Stopped listening on {}", self.listen_addr);
    }

    /// Serves requests on an inbound connection. The connection ends after an
    /// InstallSnapshot request, since the body is handed off to the node.
    fn serve(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        loop {
            let Some(request) = Request::maybe_decode_from(&mut reader)? else {
                return Ok(());
            };
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::TransportShutdown);
            }
            let (response_tx, response_rx) = crossbeam::channel::bounded(1);
            let mut rpc = Rpc::new(request, response_tx);
            if let Request::InstallSnapshot(request) = &rpc.request {
                let size = request.size;
                rpc.reader = Some(Box::new(reader.take(size)));
                self.dispatch(rpc, response_rx).encode_into(&mut writer)?;
                writer.flush()?;
                return Ok(());
            }
            self.dispatch(rpc, response_rx).encode_into(&mut writer)?;
            writer.flush()?;
        }
    }

    /// Hands an inbound RPC to the heartbeat handler or the consumer, and
    /// waits for the response.
    fn dispatch(&self, mut rpc: Rpc, response_rx: Receiver<Result<Response>>) -> Result<Response> {
        if matches!(&rpc.request, Request::AppendEntries(r) if r.is_heartbeat()) {
            let handler = self.heartbeat.read()?.clone();
            if let Some(handler) = handler {
                match handler(rpc) {
                    Some(unhandled) => rpc = unhandled,
                    None => return response_rx.recv().unwrap_or(Err(Error::TransportShutdown)),
                }
            }
        }
        crossbeam::select! {
            send(self.consumer_tx, rpc) -> sent => sent?,
            recv(self.shutdown_rx) -> _ => return Err(Error::TransportShutdown),
        }
        crossbeam::select! {
            recv(response_rx) -> response => response.unwrap_or(Err(Error::TransportShutdown)),
            recv(self.shutdown_rx) -> _ => Err(Error::TransportShutdown),
        }
    }
}

impl Transport for Tcp {
    fn consumer(&self) -> Receiver<Rpc> {
        self.inner.consumer_rx.clone()
    }

    fn local_addr(&self) -> ServerAddress {
        self.inner.addr.clone()
    }

    fn append_entries(
        &self,
        id: &str,
        target: &str,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.request(id, target, Request::AppendEntries(request.clone()))?.into_append_entries()
    }

    fn request_vote(
        &self,
        id: &str,
        target: &str,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.request(id, target, Request::RequestVote(request.clone()))?.into_request_vote()
    }

    fn install_snapshot(
        &self,
        id: &str,
        target: &str,
        request: &InstallSnapshotRequest,
        mut data: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::TransportShutdown);
        }
        // The server closes the connection afterwards, so don't pool it.
        let mut conn = Conn::dial(target, self.inner.options.timeout)?;
        let scale = (request.size / SNAPSHOT_TIMEOUT_UNIT).max(1) as u32;
        conn.set_timeout(self.inner.options.timeout.saturating_mul(scale))?;
        conn.send(&Request::InstallSnapshot(request.clone()))?;
        let sent = std::io::copy(&mut data.as_mut().take(request.size), &mut conn.writer)?;
        if sent != request.size {
            return Err(Error::IO(format!(
                "short snapshot read: sent {sent} of {} bytes",
                request.size
            )));
        }
        conn.writer.flush()?;
        debug!("Sent {sent} byte snapshot to {}", peer_name(id, target));
        conn.receive()??.into_install_snapshot()
    }

    fn timeout_now(
        &self,
        id: &str,
        target: &str,
        request: &TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        self.request(id, target, Request::TimeoutNow(request.clone()))?.into_timeout_now()
    }

    fn append_entries_pipeline(&self, id: &str, target: &str) -> Result<Box<dyn AppendPipeline>> {
        let max_in_flight = self.inner.options.max_rpcs_in_flight;
        if max_in_flight < 2 {
            return Err(Error::PipelineReplicationNotSupported);
        }
        let conn = self.conn(id, target)?;
        conn.set_timeout(self.inner.options.timeout)?;
        Ok(Box::new(TcpPipeline::new(conn, max_in_flight)?))
    }

    fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>) {
        match self.inner.heartbeat.write() {
            Ok(mut heartbeat) => *heartbeat = handler,
            Err(err) => error!("Failed to set heartbeat handler: {err}"),
        }
    }

    fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown_tx.lock()?.take();
        self.inner.pool.lock()?.clear();
        // Wake up the listener so it notices the shutdown.
        let mut wake = self.inner.listen_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        let _ = TcpStream::connect_timeout(&wake, self.inner.options.timeout);
        Ok(())
    }
}

/// An outbound connection.
struct Conn {
    target: ServerAddress,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Conn {
    fn dial(target: &str, timeout: Duration) -> Result<Self> {
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::IO(format!("failed to resolve {target}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            target: target.to_string(),
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let stream = self.writer.get_ref();
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        request.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Receives a response. The outer result is a transport error, the inner
    /// one the remote node's error.
    fn receive(&mut self) -> Result<Result<Response>> {
        Result::<Response>::maybe_decode_from(&mut self.reader)?
            .ok_or_else(|| Error::IO(format!("connection to {} closed", self.target)))
    }
}

/// A pipeline of AppendEntries requests over a dedicated connection. A
/// decoder thread reads the responses in request order.
struct TcpPipeline {
    writer: BufWriter<TcpStream>,
    inflight_tx: Sender<(AppendEntriesRequest, Instant)>,
    done_rx: Receiver<AppendResult>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
}

impl TcpPipeline {
    fn new(conn: Conn, max_in_flight: usize) -> Result<Self> {
        let Conn { target, reader, writer } = conn;
        let (inflight_tx, inflight_rx) = crossbeam::channel::bounded(max_in_flight - 1);
        let (done_tx, done_rx) = crossbeam::channel::bounded(max_in_flight - 1);
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
        let decoder_shutdown_rx = shutdown_rx.clone();
        std::thread::spawn(move || {
            Self::decode(&target, reader, inflight_rx, done_tx, decoder_shutdown_rx)
        });
        Ok(Self { writer, inflight_tx, done_rx, shutdown_tx: Some(shutdown_tx), shutdown_rx })
    }

    fn decode(
        target: &str,
        mut reader: BufReader<TcpStream>,
        inflight_rx: Receiver<(AppendEntriesRequest, Instant)>,
        done_tx: Sender<AppendResult>,
        shutdown_rx: Receiver<()>,
    ) {
        loop {
            let (request, started) = crossbeam::select! {
                recv(inflight_rx) -> inflight => match inflight {
                    Ok(inflight) => inflight,
                    Err(_) => return,
                },
                recv(shutdown_rx) -> _ => return,
            };
            let (response, failed) = match Result::<Response>::maybe_decode_from(&mut reader) {
                Ok(Some(response)) => (response.and_then(|r| r.into_append_entries()), false),
                Ok(None) => (Err(Error::IO(format!("pipeline to {target} closed"))), true),
                Err(err) => (Err(err), true),
            };
            crossbeam::select! {
                send(done_tx, AppendResult { request, response, started }) -> sent => {
                    if sent.is_err() { return }
                },
                recv(shutdown_rx) -> _ => return,
            }
            if failed {
                return;
            }
        }
    }
}

impl AppendPipeline for TcpPipeline {
    fn append_entries(&mut self, request: AppendEntriesRequest) -> Result<()> {
        if matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected)) {
            return Err(Error::PipelineShutdown);
        }
        // Reserve an in-flight slot first, blocking if the pipeline is full.
        crossbeam::select! {
            send(self.inflight_tx, (request.clone(), Instant::now())) -> sent => {
                sent.map_err(|_| Error::PipelineShutdown)?
            },
            recv(self.shutdown_rx) -> _ => return Err(Error::PipelineShutdown),
        }
        Request::AppendEntries(request).encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    fn consumer(&self) -> Receiver<AppendResult> {
        self.done_rx.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.shutdown_tx.take().is_some() {
            // Unblock the decoder if it's waiting for a response.
            let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

impl Drop for TcpPipeline {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transport() -> Tcp {
        Tcp::bind("127.0.0.1:0", TcpOptions { timeout: Duration::from_secs(5), ..Default::default() })
            .unwrap()
    }

    /// Answers AppendEntries requests with the request's prev_log_entry as
    /// last_log, and InstallSnapshot requests with the body length as term.
    fn serve(transport: &Tcp) {
        let consumer = transport.consumer();
        std::thread::spawn(move || {
            while let Ok(mut rpc) = consumer.recv() {
                let response = match &rpc.request {
                    Request::AppendEntries(r) => Response::AppendEntries(AppendEntriesResponse {
                        term: r.term,
                        last_log: r.prev_log_entry,
                        success: true,
                        ..Default::default()
                    }),
                    Request::RequestVote(_) => {
                        rpc.respond(Err(Error::NotVoter));
                        continue;
                    }
                    Request::InstallSnapshot(_) => {
                        let mut data = Vec::new();
                        let _ = rpc.reader.take().unwrap().read_to_end(&mut data);
                        Response::InstallSnapshot(InstallSnapshotResponse {
                            term: data.len() as u64,
                            success: true,
                            ..Default::default()
                        })
                    }
                    Request::TimeoutNow(_) => Response::TimeoutNow(TimeoutNowResponse::default()),
                };
                rpc.respond(Ok(response));
            }
        });
    }

    #[test]
    fn request_response() -> Result<()> {
        let (a, b) = (transport(), transport());
        serve(&b);
        let target = b.local_addr();

        let request = AppendEntriesRequest { term: 2, prev_log_entry: 9, ..Default::default() };
        for _ in 0..3 {
            let response = a.append_entries("b", &target, &request)?;
            assert_eq!((response.term, response.last_log), (2, 9));
        }
        // The connection was reused.
        assert_eq!(a.inner.pool.lock()?.get(&target).map(|c| c.len()), Some(1));

        // Remote errors are propagated.
        let request = RequestVoteRequest::default();
        assert_eq!(a.request_vote("b", &target, &request), Err(Error::NotVoter));
        a.timeout_now("b", &target, &TimeoutNowRequest::default())?;
        Ok(())
    }

    #[test]
    fn install_snapshot() -> Result<()> {
        let (a, b) = (transport(), transport());
        serve(&b);
        let target = b.local_addr();
        let data = vec![7; 1000];
        let request = InstallSnapshotRequest { term: 1, size: 1000, ..Default::default() };
        let response = a.install_snapshot("b", &target, &request, Box::new(std::io::Cursor::new(data)))?;
        assert_eq!(response.term, 1000);

        // A short body fails.
        let request = InstallSnapshotRequest { term: 1, size: 10, ..Default::default() };
        let result = a.install_snapshot("b", &target, &request, Box::new(&b"short"[..]));
        assert!(matches!(result, Err(Error::IO(_))));
        Ok(())
    }

    #[test]
    fn heartbeat_handler() -> Result<()> {
        let (a, b) = (transport(), transport());
        b.set_heartbeat_handler(Some(Arc::new(|rpc: Rpc| {
            rpc.respond(Ok(Response::AppendEntries(AppendEntriesResponse {
                term: 42,
                success: true,
                ..Default::default()
            })));
            None
        })));
        let heartbeat =
            AppendEntriesRequest { term: 1, leader: b"a".to_vec(), ..Default::default() };
        assert_eq!(a.append_entries("b", &b.local_addr(), &heartbeat)?.term, 42);
        assert!(b.consumer().is_empty());
        Ok(())
    }

    #[test]
    fn pipeline() -> Result<()> {
        let (a, b) = (transport(), transport());
        serve(&b);
        let mut pipeline = a.append_entries_pipeline("b", &b.local_addr())?;
        let consumer = pipeline.consumer();
        let sender = std::thread::spawn(move || -> Result<Box<dyn AppendPipeline>> {
            for index in 1..=5 {
                pipeline.append_entries(AppendEntriesRequest {
                    term: 1,
                    prev_log_entry: index,
                    ..Default::default()
                })?;
            }
            Ok(pipeline)
        });
        for index in 1..=5 {
            let result = consumer.recv()?;
            assert_eq!(result.request.prev_log_entry, index);
            assert_eq!(result.response?.last_log, index);
        }
        let mut pipeline = sender.join().unwrap()?;
        pipeline.close()?;
        assert_eq!(
            pipeline.append_entries(AppendEntriesRequest::default()),
            Err(Error::PipelineShutdown)
        );
        Ok(())
    }

    #[test]
    fn pipeline_disabled() {
        let a = Tcp::bind("127.0.0.1:0", TcpOptions { max_rpcs_in_flight: 1, ..Default::default() })
            .unwrap();
        let b = transport();
        assert!(matches!(
            a.append_entries_pipeline("b", &b.local_addr()),
            Err(Error::PipelineReplicationNotSupported)
        ));
    }

    #[test]
    fn close() -> Result<()> {
        let (a, b) = (transport(), transport());
        serve(&b);
        a.close()?;
        let request = AppendEntriesRequest::default();
        assert_eq!(
            a.append_entries("b", &b.local_addr(), &request),
            Err(Error::TransportShutdown)
        );
        Ok(())
    }

    #[test]
    fn unadvertisable() {
        assert!(matches!(
            Tcp::bind("0.0.0.0:0", TcpOptions::default()),
            Err(Error::InvalidInput(_))
        ));
    }
}
