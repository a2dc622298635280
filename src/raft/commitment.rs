use super::{Configuration, Index, ServerID};

use crossbeam::channel::Sender;
use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks the leader's commit index. Replication workers report each voter's
/// match index (the highest index known to be stored on that voter), and the
/// commit index is the highest index stored on a quorum. Entries from prior
/// terms are never committed directly: the commit index only advances to
/// start_index (the leader's first entry in its term) or beyond. The leader's
/// main loop is notified via commit_tx whenever the commit index advances.
pub(crate) struct Commitment {
    inner: Mutex<Inner>,
    commit_tx: Sender<()>,
    start_index: Index,
}

struct Inner {
    /// Match indexes by voter ID.
    match_indexes: HashMap<ServerID, Index>,
    commit_index: Index,
}

impl Commitment {
    /// Creates a new tracker for the voters in the configuration.
    pub fn new(commit_tx: Sender<()>, configuration: &Configuration, start_index: Index) -> Self {
        let match_indexes = configuration.voters().map(|s| (s.id.clone(), 0)).collect();
        Self { inner: Mutex::new(Inner { match_indexes, commit_index: 0 }), commit_tx, start_index }
    }

    /// Returns the first index that may be committed in this term.
    pub fn start_index(&self) -> Index {
        self.start_index
    }

    /// Updates the set of voters. Retained voters keep their match index,
    /// new voters start at 0. The commit index may advance if voters were
    /// removed.
    pub fn set_configuration(&self, configuration: &Configuration) {
        let Ok(mut inner) = self.inner.lock() else { return };
        let old = std::mem::take(&mut inner.match_indexes);
        inner.match_indexes = configuration
            .voters()
            .map(|s| (s.id.clone(), old.get(&s.id).copied().unwrap_or(0)))
            .collect();
        self.recalculate(&mut inner);
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> Index {
        self.inner.lock().map(|inner| inner.commit_index).unwrap_or(0)
    }

    /// Records that the given server has stored entries up to the index.
    /// Non-voters and stale indexes are ignored.
    pub fn match_index(&self, server: &str, index: Index) {
        let Ok(mut inner) = self.inner.lock() else { return };
        match inner.match_indexes.get_mut(server) {
            Some(prev) if index > *prev => *prev = index,
            _ => return,
        }
        self.recalculate(&mut inner);
    }

    /// Recomputes the commit index as the quorum match index, notifying the
    /// main loop if it advanced.
    fn recalculate(&self, inner: &mut Inner) {
        if inner.match_indexes.is_empty() {
            return;
        }
        let mut matched: Vec<Index> = inner.match_indexes.values().copied().collect();
        matched.sort_unstable();
        let quorum_index = matched[(matched.len() - 1) / 2];
        if quorum_index > inner.commit_index && quorum_index >= self.start_index {
            inner.commit_index = quorum_index;
            let _ = self.commit_tx.try_send(());
        }
    }
}
