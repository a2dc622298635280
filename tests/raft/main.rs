//! In-process cluster tests. Each test runs a cluster of Raft nodes over the
//! in-memory transport (or TCP on localhost), and exercises elections,
//! replication, membership changes and snapshots end to end.

#![warn(clippy::all)]

mod cluster;
mod leadership;
mod membership;
mod persistence;
mod replication;
mod snapshot;
mod tcp;
