//! Offline cluster management: bootstrapping a fresh cluster, and manually
//! recovering one that has permanently lost its quorum.

use super::state::State;
use super::{
    encode_peers, snapshot_version, Config, Configuration, Entry, EntryKind, Transport,
    KEY_CURRENT_TERM,
};
use crate::error::{Error, Result};
use crate::storage::{LogStore, SnapshotStore, StableStore};

use log::{info, warn};

/// Bootstraps a new cluster with the given configuration, by writing it as
/// the first log entry in term 1. Every server in the configuration should be
/// bootstrapped with an identical configuration. Returns
/// [`Error::CantBootstrap`] if the server has any existing state.
pub fn bootstrap_cluster(
    config: &Config,
    log: &dyn LogStore,
    stable: &dyn StableStore,
    snapshots: &dyn SnapshotStore,
    transport: &dyn Transport,
    configuration: &Configuration,
) -> Result<()> {
    config.validate()?;
    configuration.check()?;
    if has_existing_state(log, stable, snapshots)? {
        return Err(Error::CantBootstrap);
    }

    stable.set_u64(KEY_CURRENT_TERM, 1)?;
    let mut entry = match config.protocol_version < 3 {
        true => Entry::new(EntryKind::RemovePeerDeprecated, encode_peers(configuration, transport)),
        false => Entry::new(EntryKind::Configuration, configuration.encode()),
    };
    (entry.index, entry.term) = (1, 1);
    log.store_log(&entry)
        .map_err(|err| Error::IO(format!("failed to append configuration entry to log: {err}")))?;
    info!("Bootstrapped cluster with {:?}", configuration.servers);
    Ok(())
}

/// Returns true if the server has any Raft state: a current term, log
/// entries, or snapshots.
pub fn has_existing_state(
    log: &dyn LogStore,
    stable: &dyn StableStore,
    snapshots: &dyn SnapshotStore,
) -> Result<bool> {
    if stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0) > 0 {
        return Ok(true);
    }
    if log.last_index()? > 0 {
        return Ok(true);
    }
    Ok(!snapshots.list()?.is_empty())
}

/// Manually forces a new configuration onto a server that has lost its
/// quorum, e.g. after losing a majority of servers. The server must be
/// offline. The latest snapshot and log entries are replayed into the state
/// machine, and a new snapshot is written with the given configuration as if
/// committed at index 1. The log is then emptied.
///
/// This is a dangerous operation: committed entries may be lost or diverge
/// if it isn't run with the same configuration on all remaining servers.
pub fn recover_cluster(
    config: &Config,
    state: &mut dyn State,
    log: &dyn LogStore,
    stable: &dyn StableStore,
    snapshots: &dyn SnapshotStore,
    configuration: &Configuration,
) -> Result<()> {
    config.validate()?;
    configuration.check()?;
    if !has_existing_state(log, stable, snapshots)? {
        return Err(Error::InvalidInput(
            "refused to recover cluster with no initial state, this is probably an operator error"
                .into(),
        ));
    }

    let available = snapshots.list()?;
    let (mut last_index, mut last_term) = (0, 0);
    for meta in &available {
        let result = snapshots.open(&meta.id).and_then(|(_, mut reader)| state.restore(&mut reader));
        if let Err(err) = result {
            warn!("Failed to restore snapshot {}: {err}", meta.id);
            continue;
        }
        (last_index, last_term) = (meta.index, meta.term);
        break;
    }
    if !available.is_empty() && (last_index == 0 || last_term == 0) {
        return Err(Error::IO("failed to restore any of the available snapshots".into()));
    }

    // Replay commands past the snapshot. Their results are discarded.
    let snapshot_index = last_index;
    let last_log_index = log.last_index()?;
    for index in snapshot_index + 1..=last_log_index {
        let entry = log.get_log(index)?.ok_or(Error::LogNotFound)?;
        if entry.kind == EntryKind::Command {
            let _ = state.apply(&entry);
        }
        (last_index, last_term) = (entry.index, entry.term);
    }

    let mut snapshot = state.snapshot()?;
    let version = snapshot_version(config.protocol_version);
    let mut sink = snapshots.create(version, last_index, last_term, configuration, 1)?;
    if let Err(err) = snapshot.persist(&mut sink) {
        sink.cancel()?;
        return Err(Error::IO(format!("failed to persist snapshot: {err}")));
    }
    sink.close()?;
    snapshot.release();

    // Configuration entries left in the log would override the recovered
    // configuration.
    if last_log_index > 0 {
        let first_index = log.first_index()?;
        log.delete_range(first_index, last_log_index)
            .map_err(|err| Error::IO(format!("log compaction failed: {err}")))?;
    }
    info!("Recovered cluster at index {last_index} term {last_term} with {:?}", configuration.servers);
    Ok(())
}
