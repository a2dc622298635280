use super::{RequestVoteRequest, Role, Server, ServerAddress, ServerID};

use crossbeam::channel::Sender;
use log::error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// An event emitted by a node to its registered observers.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// The node changed role.
    Role(Role),
    /// The known leader changed. Empty when the leader is unknown.
    Leader { address: ServerAddress, id: ServerID },
    /// The leader started or stopped replicating to a peer.
    Peer { server: Server, removed: bool },
    /// A heartbeat to a peer failed.
    FailedHeartbeat { peer: ServerID, last_contact: Instant },
    /// Heartbeats to a peer succeeded again after failing.
    ResumedHeartbeat { peer: ServerID },
    /// A RequestVote request was received.
    RequestVote(RequestVoteRequest),
}

/// Filters observations. Only observations for which it returns true are
/// delivered.
pub type ObservationFilter = Arc<dyn Fn(&Observation) -> bool + Send + Sync>;

/// An observer, delivering observations to a channel. A non-blocking
/// observer drops observations when the channel is full, a blocking one
/// waits for space, which stalls the node until the receiver catches up.
pub struct Observer {
    tx: Sender<Observation>,
    blocking: bool,
    filter: Option<ObservationFilter>,
    observed: AtomicU64,
    dropped: AtomicU64,
}

impl Observer {
    /// Creates a new observer.
    pub fn new(
        tx: Sender<Observation>,
        blocking: bool,
        filter: Option<ObservationFilter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tx,
            blocking,
            filter,
            observed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Returns the number of delivered observations.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped observations.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, observation: &Observation) {
        if let Some(filter) = &self.filter {
            if !filter(observation) {
                return;
            }
        }
        let delivered = match self.blocking {
            true => self.tx.send(observation.clone()).is_ok(),
            false => self.tx.try_send(observation.clone()).is_ok(),
        };
        match delivered {
            true => self.observed.fetch_add(1, Ordering::Relaxed),
            false => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// A registry of observers. IDs are assigned per registry.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    observers: RwLock<HashMap<u64, Arc<Observer>>>,
}

impl Observers {
    /// Registers an observer, returning its ID for deregistration.
    pub fn register(&self, observer: Arc<Observer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.observers.write() {
            Ok(mut observers) => {
                observers.insert(id, observer);
            }
            Err(err) => error!("Failed to register observer: {err}"),
        }
        id
    }

    /// Deregisters an observer.
    pub fn deregister(&self, id: u64) {
        match self.observers.write() {
            Ok(mut observers) => {
                observers.remove(&id);
            }
            Err(err) => error!("Failed to deregister observer: {err}"),
        }
    }

    /// Delivers an observation to all observers.
    pub fn observe(&self, observation: Observation) {
        let Ok(observers) = self.observers.read() else {
            return;
        };
        for observer in observers.values() {
            observer.deliver(&observation);
        }
    }
}
