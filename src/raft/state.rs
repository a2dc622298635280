use super::{Configuration, Entry, Index};
use crate::error::Result;

use std::io::{Read, Write};

/// A Raft-managed state machine (FSM). Raft itself does not care what the
/// state machine is, nor what the commands and results do -- it will simply
/// apply arbitrary binary commands sequentially from the Raft log, returning
/// an arbitrary binary result to the client.
///
/// Since commands are applied identically across all replicas, they must be
/// deterministic and yield the same state and result across all replicas too.
/// Otherwise, the replicas will diverge, and different replicas will produce
/// different results.
///
/// All methods are called from a single FSM thread, so apply and restore are
/// never concurrent. A snapshot handle returned by [`State::snapshot`] is
/// persisted on a different thread while applies continue, so it must capture
/// a consistent point-in-time view.
pub trait State: Send {
    /// Applies a committed command entry to the state machine, returning a
    /// client result. Errors are considered applied and propagated back to
    /// the client.
    ///
    /// Any non-deterministic apply error (e.g. an IO error) must panic and
    /// crash the node -- if it instead returns an error to the client, the
    /// command is considered applied and replica states will diverge.
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>>;

    /// Returns a point-in-time snapshot handle of the state machine.
    fn snapshot(&mut self) -> Result<Box<dyn Snapshot>>;

    /// Replaces the entire state machine with the contents of a snapshot.
    fn restore(&mut self, reader: &mut dyn Read) -> Result<()>;

    /// Returns the batching capability, if supported. Batches of committed
    /// entries are then applied via a single call.
    fn as_batching(&mut self) -> Option<&mut dyn BatchingState> {
        None
    }

    /// Returns the configuration store capability, if supported. It is
    /// notified of every committed configuration entry.
    fn as_configuration_store(&mut self) -> Option<&mut dyn ConfigurationStore> {
        None
    }
}

/// A state machine that applies committed entries in batches.
pub trait BatchingState {
    /// Applies a batch of command and configuration entries, returning one
    /// result per entry in the same order.
    fn apply_batch(&mut self, entries: &[Entry]) -> Vec<Result<Vec<u8>>>;
}

/// A state machine that tracks the cluster configuration.
pub trait ConfigurationStore {
    /// Stores a committed configuration entry.
    fn store_configuration(&mut self, index: Index, configuration: Configuration);
}

/// A point-in-time snapshot of a state machine.
pub trait Snapshot: Send {
    /// Writes the snapshot contents. The sink is finalized by the caller if
    /// this returns Ok, and discarded otherwise.
    fn persist(&mut self, sink: &mut dyn Write) -> Result<()>;

    /// Releases any resources held by the snapshot once persisted.
    fn release(&mut self) {}
}
