use super::{Index, Transport};
use crate::encoding::{self, bincode};
use crate::errinput;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A server ID. Opaque, non-empty, and unique for the lifetime of the cluster.
pub type ServerID = String;

/// A server address, as understood by the transport.
pub type ServerAddress = String;

/// A server's role in elections and commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Suffrage {
    /// A server whose vote counts in elections and whose match index counts
    /// towards commitment.
    Voter,
    /// A server that receives log entries but does not vote or count towards
    /// commitment.
    Nonvoter,
    /// A legacy transitional state, behaving like Nonvoter.
    Staging,
}

impl std::fmt::Display for Suffrage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suffrage::Voter => write!(f, "Voter"),
            Suffrage::Nonvoter => write!(f, "Nonvoter"),
            Suffrage::Staging => write!(f, "Staging"),
        }
    }
}

/// A server in a configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    /// Whether the server gets a vote.
    pub suffrage: Suffrage,
    /// The server's unique ID.
    pub id: ServerID,
    /// The server's network address.
    pub address: ServerAddress,
}

impl Server {
    /// Creates a new voter.
    pub fn voter(id: impl Into<ServerID>, address: impl Into<ServerAddress>) -> Self {
        Self { suffrage: Suffrage::Voter, id: id.into(), address: address.into() }
    }

    /// Creates a new nonvoter.
    pub fn nonvoter(id: impl Into<ServerID>, address: impl Into<ServerAddress>) -> Self {
        Self { suffrage: Suffrage::Nonvoter, id: id.into(), address: address.into() }
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.suffrage, self.id, self.address)
    }
}

/// A cluster configuration: the set of servers participating in consensus.
/// Every membership change is a single configuration log entry carrying the
/// full next configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl encoding::Value for Configuration {}

impl Configuration {
    /// Creates a configuration from a list of servers.
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Returns true if the server is a voter in the configuration.
    pub fn has_vote(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id && s.suffrage == Suffrage::Voter)
    }

    /// Returns true if the server is in the configuration, regardless of
    /// suffrage.
    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    /// Looks up a server by ID.
    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Iterates over the voters.
    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.suffrage == Suffrage::Voter)
    }

    /// Checks the configuration invariants: unique non-empty IDs and
    /// addresses, and at least one voter.
    pub fn check(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        let mut voters = 0;
        for server in &self.servers {
            if server.id.is_empty() {
                return errinput!("empty ID in configuration: {self:?}");
            }
            if server.address.is_empty() {
                return errinput!("empty address in configuration: {server}");
            }
            if !ids.insert(&server.id) {
                return errinput!("found duplicate ID in configuration: {}", server.id);
            }
            if !addresses.insert(&server.address) {
                return errinput!("found duplicate address in configuration: {}", server.address);
            }
            if server.suffrage == Suffrage::Voter {
                voters += 1;
            }
        }
        if voters == 0 {
            return errinput!("need at least one voter in configuration: {self:?}");
        }
        Ok(())
    }

    /// Encodes the configuration for a configuration log entry or snapshot.
    pub fn encode(&self) -> Vec<u8> {
        encoding::Value::encode(self)
    }

    /// Decodes a configuration from a log entry or snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        encoding::Value::decode(bytes)
    }
}

/// The committed and latest configurations tracked by every server. At most
/// one uncommitted configuration may exist at a time: a new change can only be
/// proposed when latest_index == committed_index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Configurations {
    /// The latest configuration in the log with index ≤ commit index.
    pub committed: Configuration,
    /// The log index of the committed configuration.
    pub committed_index: Index,
    /// The latest configuration in the log, possibly uncommitted.
    pub latest: Configuration,
    /// The log index of the latest configuration.
    pub latest_index: Index,
}

impl Configurations {
    /// Returns true if the latest configuration is committed.
    pub fn stable(&self) -> bool {
        self.latest_index == self.committed_index
    }
}

/// A membership change command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeCommand {
    /// Adds a server as a voter (legacy form, protocol ≤ 2).
    AddStaging,
    /// Adds a server as a nonvoter.
    AddNonvoter,
    /// Demotes a voter to a nonvoter.
    DemoteVoter,
    /// Removes a server.
    RemoveServer,
    /// Promotes a staging server to a voter.
    Promote,
    /// Adds a server as a voter.
    AddVoter,
}

/// A membership change request, computed against the latest configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurationChange {
    pub command: ChangeCommand,
    pub id: ServerID,
    /// Only used by the add commands.
    pub address: ServerAddress,
    /// If non-zero, the change is rejected unless the latest configuration
    /// is at this index.
    pub prev_index: Index,
}

/// Computes the configuration that results from applying a change to the
/// current configuration at the given index, and validates it.
pub fn next_configuration(
    current: &Configuration,
    current_index: Index,
    change: &ConfigurationChange,
) -> Result<Configuration> {
    if change.prev_index > 0 && change.prev_index != current_index {
        return Err(Error::ConfigurationChanged { since: change.prev_index, latest: current_index });
    }

    let mut next = current.clone();
    let position = next.servers.iter().position(|s| s.id == change.id);
    match change.command {
        ChangeCommand::AddStaging | ChangeCommand::AddVoter => {
            // Staging is treated as a voter, there is no promotion process.
            let server = Server::voter(change.id.clone(), change.address.clone());
            match position {
                Some(i) if next.servers[i].suffrage == Suffrage::Voter => {
                    next.servers[i].address = change.address.clone()
                }
                Some(i) => next.servers[i] = server,
                None => next.servers.push(server),
            }
        }
        ChangeCommand::AddNonvoter => {
            let server = Server::nonvoter(change.id.clone(), change.address.clone());
            match position {
                Some(i) if next.servers[i].suffrage != Suffrage::Nonvoter => {
                    next.servers[i].address = change.address.clone()
                }
                Some(i) => next.servers[i] = server,
                None => next.servers.push(server),
            }
        }
        ChangeCommand::DemoteVoter => {
            if let Some(i) = position {
                next.servers[i].suffrage = Suffrage::Nonvoter;
            }
        }
        ChangeCommand::RemoveServer => {
            if let Some(i) = position {
                next.servers.remove(i);
            }
        }
        ChangeCommand::Promote => {
            if let Some(i) = position {
                if next.servers[i].suffrage == Suffrage::Staging {
                    next.servers[i].suffrage = Suffrage::Voter;
                }
            }
        }
    }

    // Make sure we didn't do something bad like remove the last voter.
    next.check()?;
    Ok(next)
}

/// Encodes the voters of a configuration in the legacy peers format used by
/// protocol versions < 3: a list of transport-encoded addresses.
pub fn encode_peers(configuration: &Configuration, transport: &dyn Transport) -> Vec<u8> {
    let peers: Vec<serde_bytes::ByteBuf> = configuration
        .voters()
        .map(|s| serde_bytes::ByteBuf::from(transport.encode_peer(&s.id, &s.address)))
        .collect();
    bincode::serialize(&peers)
}

/// Decodes the legacy peers format into a configuration of voters, using
/// each address as the server ID.
pub fn decode_peers(bytes: &[u8], transport: &dyn Transport) -> Result<Configuration> {
    let peers: Vec<serde_bytes::ByteBuf> = bincode::deserialize(bytes)?;
    let servers = peers
        .iter()
        .map(|peer| {
            let address = transport.decode_peer(peer);
            Server::voter(address.clone(), address)
        })
        .collect();
    Ok(Configuration::new(servers))
}

/// Returns a configuration from the given entry data, handling both the
/// current and legacy formats.
pub(crate) fn decode_entry(
    kind: super::EntryKind,
    data: &[u8],
    transport: &dyn Transport,
) -> Result<Configuration> {
    match kind {
        super::EntryKind::Configuration => Configuration::decode(data),
        super::EntryKind::AddPeerDeprecated | super::EntryKind::RemovePeerDeprecated => {
            decode_peers(data, transport)
        }
        kind => Err(Error::InvalidData(format!("{kind} entry is not a configuration"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Configuration {
        Configuration::new(vec![
            Server::voter("id1", "addr1x"),
            Server { suffrage: Suffrage::Staging, id: "id2".into(), address: "addr2x".into() },
            Server::nonvoter("id3", "addr3x"),
        ])
    }

    fn single() -> Configuration {
        Configuration::new(vec![Server::voter("id1", "addr1x")])
    }

    fn change(command: ChangeCommand, id: &str, address: &str) -> ConfigurationChange {
        ConfigurationChange { command, id: id.into(), address: address.into(), prev_index: 0 }
    }

    #[test]
    fn has_vote() {
        let c = sample();
        assert!(c.has_vote("id1"));
        assert!(!c.has_vote("id2"));
        assert!(!c.has_vote("id3"));
        assert!(!c.has_vote("someotherid"));
    }

    #[test]
    fn check_valid() {
        assert_eq!(sample().check(), Ok(()));
    }

    /// Asserts that adding the server to the sample configuration makes it
    /// invalid, with an error containing the given message.
    macro_rules! test_check_invalid {
        ( $( $name:ident: $server:expr => $message:literal, )* ) => {
        $(
            #[test]
            fn $name() {
                let mut c = sample();
                c.servers.push($server);
                match c.check() {
                    Err(Error::InvalidInput(msg)) => assert!(msg.contains($message), "{msg}"),
                    result => panic!("unexpected result {result:?}"),
                }
            }
        )*
        };
    }

    test_check_invalid! {
        check_empty_id: Server::voter("", "addr") => "empty ID",
        check_empty_address: Server::voter("id9", "") => "empty address",
        check_duplicate_id: Server::voter("id1", "addr9") => "duplicate ID",
        check_duplicate_address: Server::voter("id9", "addr1x") => "duplicate address",
    }

    #[test]
    fn check_no_voters() {
        let c = Configuration::new(vec![Server::nonvoter("id1", "addr1")]);
        assert!(matches!(c.check(), Err(Error::InvalidInput(msg)) if msg.contains("at least one voter")));
    }

    #[test]
    fn next_configuration_table() {
        use ChangeCommand::*;
        // (current, change, expected)
        let cases: Vec<(Configuration, ConfigurationChange, Vec<Server>)> = vec![
            // AddStaging: was missing.
            (
                single(),
                change(AddStaging, "id2", "addr2"),
                vec![Server::voter("id1", "addr1x"), Server::voter("id2", "addr2")],
            ),
            // AddStaging: existing voter keeps suffrage, gets new address.
            (single(), change(AddStaging, "id1", "addr1"), vec![Server::voter("id1", "addr1")]),
            // AddVoter: existing nonvoter is promoted.
            (
                Configuration::new(vec![
                    Server::voter("id1", "addr1x"),
                    Server::nonvoter("id2", "addr2x"),
                ]),
                change(AddVoter, "id2", "addr2"),
                vec![Server::voter("id1", "addr1x"), Server::voter("id2", "addr2")],
            ),
            // AddNonvoter: was missing.
            (
                single(),
                change(AddNonvoter, "id2", "addr2"),
                vec![Server::voter("id1", "addr1x"), Server::nonvoter("id2", "addr2")],
            ),
            // AddNonvoter: existing voter keeps suffrage.
            (single(), change(AddNonvoter, "id1", "addr1"), vec![Server::voter("id1", "addr1")]),
            // DemoteVoter.
            (
                Configuration::new(vec![
                    Server::voter("id1", "addr1x"),
                    Server::voter("id2", "addr2x"),
                ]),
                change(DemoteVoter, "id2", ""),
                vec![Server::voter("id1", "addr1x"), Server::nonvoter("id2", "addr2x")],
            ),
            // DemoteVoter: missing server is a no-op.
            (single(), change(DemoteVoter, "id2", ""), vec![Server::voter("id1", "addr1x")]),
            // RemoveServer.
            (
                Configuration::new(vec![
                    Server::voter("id1", "addr1x"),
                    Server::voter("id2", "addr2x"),
                ]),
                change(RemoveServer, "id2", ""),
                vec![Server::voter("id1", "addr1x")],
            ),
            // Promote: staging becomes voter.
            (
                sample(),
                change(Promote, "id2", ""),
                vec![
                    Server::voter("id1", "addr1x"),
                    Server::voter("id2", "addr2x"),
                    Server::nonvoter("id3", "addr3x"),
                ],
            ),
            // Promote: nonvoter is left alone.
            (sample(), change(Promote, "id3", ""), sample().servers),
        ];
        for (current, change, expect) in cases {
            let next = next_configuration(&current, 1, &change)
                .unwrap_or_else(|e| panic!("{change:?} failed: {e}"));
            assert_eq!(next.servers, expect, "{change:?}");
        }
    }

    #[test]
    fn next_configuration_prev_index() {
        let mut c = change(ChangeCommand::AddVoter, "id2", "addr2");
        c.prev_index = 1;
        assert_eq!(
            next_configuration(&single(), 2, &c),
            Err(Error::ConfigurationChanged { since: 1, latest: 2 })
        );

        c.prev_index = 2;
        assert!(next_configuration(&single(), 2, &c).is_ok());
    }

    #[test]
    fn next_configuration_rejects_invalid() {
        // Removing the last voter.
        let c = change(ChangeCommand::RemoveServer, "id1", "");
        assert!(matches!(next_configuration(&single(), 1, &c), Err(Error::InvalidInput(_))));

        // Duplicate address.
        let c = change(ChangeCommand::AddVoter, "id2", "addr1x");
        assert!(matches!(next_configuration(&single(), 1, &c), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn encode_decode() -> Result<()> {
        let c = sample();
        assert_eq!(Configuration::decode(&c.encode())?, c);
        Ok(())
    }

    #[test]
    fn legacy_peers() -> Result<()> {
        let transport = crate::raft::transport::Memory::new("addr1x");
        let c = sample();
        let decoded = decode_peers(&encode_peers(&c, &transport), &transport)?;
        // Only voters survive, and the address doubles as the ID.
        assert_eq!(decoded.servers, vec![Server::voter("addr1x", "addr1x")]);
        Ok(())
    }
}
