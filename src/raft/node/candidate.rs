use super::{BootstrapRequest, Node, Role};
use crate::error::{Error, Result};
use crate::raft::{RequestVoteRequest, ServerID, Term};

use crossbeam::channel::Receiver;
use log::{debug, error, info, warn};

/// A vote received from a voter, or a failed vote request.
struct Vote {
    voter: ServerID,
    term: Term,
    granted: bool,
}

impl Node {
    /// Runs the candidate role: starts an election in a new term and waits
    /// for a quorum of votes, a leader, or the election timeout.
    pub(super) fn run_candidate(&mut self) -> Result<()> {
        info!("Entering candidate state in term {}", self.shared.current_term() + 1);
        let result = self.campaign();
        // The transfer flag lets the election disrupt a known leader, so it
        // only applies to the election triggered by the TimeoutNow.
        self.candidate_from_transfer = false;
        result
    }

    fn campaign(&mut self) -> Result<()> {
        let votes_rx = self.elect_self()?;
        let term = self.shared.current_term();
        let election_timer = super::random_timeout(self.shared.config().election_timeout);
        let mut granted = 0;
        let votes_needed = self.quorum_size();
        debug!("Calculated {votes_needed} votes needed for term {term}");

        let inbox = self.inbox.clone();
        let shutdown_rx = self.shared.shutdown_rx.clone();
        let never = crossbeam::channel::never();
        let mut votes_done = false;
        while self.shared.role() == Role::Candidate {
            let votes = if votes_done { &never } else { &votes_rx };
            crossbeam::select! {
                recv(inbox.rpc_rx) -> rpc => self.process_rpc(rpc?)?,

                recv(votes) -> vote => match vote {
                    Ok(vote) => {
                        if vote.term > self.shared.current_term() {
                            debug!("Newer term {} discovered, falling back to follower", vote.term);
                            self.shared.set_role(Role::Follower);
                            self.shared.set_current_term(vote.term)?;
                            return Ok(());
                        }
                        if vote.granted {
                            granted += 1;
                            debug!("Vote granted by {} in term {term}, tally {granted}", vote.voter);
                        }
                        if granted >= votes_needed {
                            info!("Election won in term {term} with {granted} votes");
                            self.shared.set_role(Role::Leader);
                            self.shared.set_leader(
                                self.shared.local_addr.clone(),
                                self.shared.local_id.clone(),
                            );
                            return Ok(());
                        }
                    }
                    // All voters answered without a quorum, wait for the
                    // election timeout.
                    Err(_) => votes_done = true,
                },

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
                    let BootstrapRequest { responder, .. } = request?;
                    responder.respond(Err(Error::CantBootstrap));
                }

                recv(election_timer) -> _ => {
                    warn!("Election timeout reached, restarting election");
                    return Ok(());
                }

                recv(shutdown_rx) -> _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Increments the term, votes for the local server and requests votes
    /// from all other voters in the latest configuration. Returns a channel
    /// of votes, including the local one.
    fn elect_self(&mut self) -> Result<Receiver<Vote>> {
        let (votes_tx, votes_rx) =
            crossbeam::channel::bounded(self.configurations.latest.servers.len().max(1));

        let term = self.shared.current_term() + 1;
        self.shared.set_current_term(term)?;
        let (last_log_index, last_log_term) = self.shared.last_entry();
        let request = RequestVoteRequest {
            header: self.shared.header(),
            term,
            candidate: self.shared.encoded_local(),
            last_log_index,
            last_log_term,
            leadership_transfer: self.candidate_from_transfer,
        };

        // The vote must be durable before any peer sees the request.
        let local_id = &self.shared.local_id;
        if self.configurations.latest.has_vote(local_id) {
            debug!("Voting for self in term {term}");
            if let Err(err) = self.shared.persist_vote(term, &request.header.addr) {
                error!("Failed to persist vote: {err}");
                return Ok(crossbeam::channel::never());
            }
            let _ = votes_tx.send(Vote { voter: local_id.clone(), term, granted: true });
        }

        for server in self.configurations.latest.voters() {
            if &server.id == local_id {
                continue;
            }
            debug!("Asking {} at {} for vote in term {term}", server.id, server.address);
            let transport = self.shared.transport.clone();
            let (votes_tx, request, server) = (votes_tx.clone(), request.clone(), server.clone());
            std::thread::spawn(move || {
                let vote = match transport.request_vote(&server.id, &server.address, &request) {
                    Ok(response) => {
                        Vote { voter: server.id, term: response.term, granted: response.granted }
                    }
                    Err(err) => {
                        error!("Failed to request vote from {} in term {term}: {err}", server.id);
                        Vote { voter: server.id, term, granted: false }
                    }
                };
                let _ = votes_tx.send(vote);
            });
        }
        Ok(votes_rx)
    }
}
