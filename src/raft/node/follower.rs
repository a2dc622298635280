use super::{BootstrapRequest, Node, Role};
use crate::error::{Error, Result};
use crate::raft::bootstrap::bootstrap_cluster;
use crate::raft::Configuration;

use log::{info, warn};

impl Node {
    /// Runs the follower role until the role changes or the node shuts down.
    /// Client requests are rejected, since only the leader serves them.
    pub(super) fn run_follower(&mut self) -> Result<()> {
        let (leader_addr, leader_id) = self.shared.leader();
        info!(
            "Entering follower state in term {} (leader {leader_id:?} at {leader_addr:?})",
            self.shared.current_term()
        );
        let mut did_warn = false;
        let mut heartbeat_timer = super::random_timeout(self.shared.config().heartbeat_timeout);

        let inbox = self.inbox.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();
        while self.shared.role() == Role::Follower {
            crossbeam::select! {
                recv(inbox.rpc_rx) -> rpc => self.process_rpc(rpc?)?,

                recv(inbox.config_change_rx) -> request => {
                    request?.responder.respond(Err(Error::NotLeader))
                }

                recv(inbox.apply_rx) -> request => request?.responder.respond(Err(Error::NotLeader)),

                recv(inbox.verify_rx) -> verify => verify?.respond(Err(Error::NotLeader)),

                recv(inbox.restore_rx) -> request => request?.responder.respond(Err(Error::NotLeader)),

                recv(inbox.transfer_rx) -> request => {
                    request?.responder.respond(Err(Error::NotLeader))
                }

                recv(inbox.configurations_rx) -> responder => {
                    responder?.respond(Ok(self.configurations.clone()))
                }

                recv(inbox.bootstrap_rx) -> request => {
                    let BootstrapRequest { configuration, responder } = request?;
                    responder.respond(self.live_bootstrap(configuration));
                }

                recv(heartbeat_timer) -> _ => {
                    let timeout = self.shared.config().heartbeat_timeout;
                    heartbeat_timer = super::random_timeout(timeout);
                    let fresh = self
                        .shared
                        .last_contact()
                        .is_some_and(|contact| contact.elapsed() < timeout);
                    if !fresh {
                        self.heartbeat_expired(&mut did_warn);
                    }
                }

                recv(shutdown_rx) -> _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Handles a heartbeat timeout: the leader is considered gone, and an
    /// election is started if the local server may vote.
    fn heartbeat_expired(&mut self, did_warn: &mut bool) {
        let (last_leader_addr, last_leader_id) = self.shared.leader();
        self.shared.set_leader("", "");

        let configurations = &self.configurations;
        let has_vote = configurations.latest.has_vote(&self.shared.local_id);
        if configurations.latest_index == 0 {
            if !*did_warn {
                warn!("No known peers, aborting election");
                *did_warn = true;
            }
        } else if configurations.stable() && !has_vote {
            if !*did_warn {
                warn!("Not part of stable configuration, aborting election");
                *did_warn = true;
            }
        } else if has_vote {
            warn!(
                "Heartbeat timeout reached, starting election (last leader {last_leader_id:?} at {last_leader_addr:?})"
            );
            self.shared.set_role(Role::Candidate);
        } else if !*did_warn {
            warn!("Heartbeat timeout reached, but not a voter, not starting election");
            *did_warn = true;
        }
    }

    /// Bootstraps a fresh cluster while running, and takes the bootstrap
    /// configuration into use.
    fn live_bootstrap(&mut self, configuration: Configuration) -> Result<()> {
        if !configuration.has_vote(&self.shared.local_id) {
            return Err(Error::NotVoter);
        }
        bootstrap_cluster(
            &self.shared.config(),
            &*self.shared.log,
            &*self.shared.stable,
            &*self.shared.snapshots,
            &*self.shared.transport,
            &configuration,
        )?;

        let entry = self.shared.log.get_log(1)?.ok_or(Error::LogNotFound)?;
        self.shared.set_current_term(1)?;
        self.shared.set_last_log(entry.index, entry.term);
        self.process_configuration_entry(&entry)
    }
}
