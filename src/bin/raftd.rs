//! raftd runs one node of a replicated key/value store built on replog. The
//! node listens for Raft traffic over TCP and keeps its log, term and
//! snapshots under the data directory. Commands are entered in an interactive
//! shell (history is stored in .raftd.history), or given on the command line
//! to run once at startup.
//!
//! Configuration is read from a YAML or TOML file (default
//! config/raftd.yaml, optional) and REPLOG_* environment variables.

#![warn(clippy::all)]

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser as _;
use itertools::Itertools as _;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde::{Deserialize, Serialize};

use replog::encoding::{bincode, Value};
use replog::errinput;
use replog::error::Result;
use replog::raft::transport::{Tcp, TcpOptions};
use replog::raft::{self, Configuration, Entry, Raft, Server, Snapshot, State};
use replog::storage::{self, LogStore, SnapshotStore, StableStore};

/// How long to wait for writes to be accepted by the leader.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// The raftd command.
#[derive(clap::Parser)]
#[command(about = "A replicated key/value store node.", version, propagate_version = true)]
struct Command {
    /// A command to execute after startup, then exit.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
    /// The configuration file path.
    #[arg(short = 'c', long, default_value = "config/raftd.yaml")]
    config: String,
}

impl Command {
    /// Runs the command.
    fn run(self) -> Result<()> {
        let cfg = Config::load(&self.config)?;
        init_logging(&cfg)?;
        let mut shell = Shell::new(cfg)?;
        let result = match self.command.is_empty() {
            true => shell.run(),
            false => shell.execute(&self.command.join(" ")),
        };
        shell.raft.shutdown().wait()?;
        result
    }
}

/// Daemon configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    /// The local server ID.
    id: String,
    /// The address to listen on for Raft traffic.
    listen: String,
    /// The address peers use to reach this node, if different from listen.
    advertise: Option<String>,
    /// The data directory.
    data_dir: String,
    /// Whether to fsync log writes.
    sync: bool,
    /// The log level.
    log_level: String,
    /// Writes logs to this file rather than stderr.
    log_file: Option<String>,
    /// The initial cluster (ID to address) used by bootstrap. The local node
    /// is always included.
    peers: HashMap<String, String>,
    /// The number of snapshots to retain.
    snapshot_retain: usize,
    heartbeat_timeout_ms: u64,
    election_timeout_ms: u64,
    leader_lease_timeout_ms: u64,
    commit_timeout_ms: u64,
    snapshot_interval_secs: u64,
    snapshot_threshold: u64,
    trailing_logs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let raft = raft::Config::default();
        Self {
            id: "raftd".into(),
            listen: "127.0.0.1:9705".into(),
            advertise: None,
            data_dir: "data".into(),
            sync: true,
            log_level: "info".into(),
            log_file: None,
            peers: HashMap::new(),
            snapshot_retain: 2,
            heartbeat_timeout_ms: raft.heartbeat_timeout.as_millis() as u64,
            election_timeout_ms: raft.election_timeout.as_millis() as u64,
            leader_lease_timeout_ms: raft.leader_lease_timeout.as_millis() as u64,
            commit_timeout_ms: raft.commit_timeout.as_millis() as u64,
            snapshot_interval_secs: raft.snapshot_interval.as_secs(),
            snapshot_threshold: raft.snapshot_threshold,
            trailing_logs: raft.trailing_logs,
        }
    }
}

impl Config {
    /// Loads the configuration from the given file, if it exists, and
    /// REPLOG_* environment variables.
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("REPLOG"))
            .build()?
            .try_deserialize()?)
    }

    /// Returns the Raft node configuration.
    fn raft(&self) -> raft::Config {
        raft::Config {
            local_id: self.id.clone(),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            leader_lease_timeout: Duration::from_millis(self.leader_lease_timeout_ms),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            snapshot_threshold: self.snapshot_threshold,
            trailing_logs: self.trailing_logs,
            ..Default::default()
        }
    }
}

/// Sets up logging. Only replog's own logs are emitted below debug level.
fn init_logging(cfg: &Config) -> Result<()> {
    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("replog");
    }
    match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            simplelog::WriteLogger::init(loglevel, logconfig.build(), file)?
        }
        None => simplelog::SimpleLogger::init(loglevel, logconfig.build())?,
    }
    Ok(())
}

/// A key/value command, applied through the Raft log.
#[derive(Debug, Serialize, Deserialize)]
enum KvCommand {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Value for KvCommand {}

/// The replicated key/value state machine. The map is shared with the shell,
/// which reads it directly.
struct Kv {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl State for Kv {
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        match KvCommand::decode(&entry.data)? {
            KvCommand::Set { key, value } => Ok(data.insert(key, value).unwrap_or_default()),
            KvCommand::Delete { key } => Ok(data.remove(&key).unwrap_or_default()),
        }
    }

    fn snapshot(&mut self) -> Result<Box<dyn Snapshot>> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Box::new(KvSnapshot(data.clone())))
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        let restored = bincode::deserialize_from(reader)?;
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}

/// A point-in-time copy of the key/value map.
struct KvSnapshot(BTreeMap<Vec<u8>, Vec<u8>>);

impl Snapshot for KvSnapshot {
    fn persist(&mut self, sink: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(sink, &self.0)
    }
}

/// An interactive raftd shell, driving the local node.
struct Shell {
    cfg: Config,
    raft: Raft,
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
    /// The Rustyline command editor.
    editor: DefaultEditor,
    /// The path to the history file, if any.
    history_path: Option<PathBuf>,
}

impl Shell {
    /// Starts the local node.
    fn new(cfg: Config) -> Result<Self> {
        let dir = PathBuf::from(&cfg.data_dir);
        std::fs::create_dir_all(&dir)?;
        let store = Arc::new(storage::File::new(dir.join("raft"), cfg.sync)?);
        let log: Arc<dyn LogStore> = store.clone();
        let stable: Arc<dyn StableStore> = store;
        let snapshots: Arc<dyn SnapshotStore> =
            Arc::new(storage::FileSnapshots::new(dir.join("snapshots"), cfg.snapshot_retain)?);
        let options = TcpOptions { advertise: cfg.advertise.clone(), ..Default::default() };
        let transport = Arc::new(Tcp::bind(&cfg.listen, options)?);

        let data = Arc::new(Mutex::new(BTreeMap::new()));
        let kv = Box::new(Kv { data: data.clone() });
        let raft = Raft::new(cfg.raft(), kv, log, stable, snapshots, transport)?;

        let editor = DefaultEditor::new()?;
        let history_path =
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".raftd.history"));
        Ok(Self { cfg, raft, data, editor, history_path })
    }

    /// Executes a command.
    fn execute(&mut self, input: &str) -> Result<()> {
        let input = input.split_ascii_whitespace().collect_vec();
        let Some((command, args)) = input.split_first() else {
            return Ok(());
        };

        match (*command, args) {
            ("set", [key, value]) => {
                let command = KvCommand::Set { key: parse_bytes(key)?, value: parse_bytes(value)? };
                let applied = self.raft.apply(command.encode(), WRITE_TIMEOUT).wait()?;
                println!("ok (index {})", applied.index);
            }
            ("set", _) => return errinput!("usage: set KEY VALUE"),

            ("get", [key]) => {
                let key = parse_bytes(key)?;
                match self.data.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
                    Some(value) => println!("{}", format_bytes(value)),
                    None => println!("<none>"),
                }
            }
            ("get", _) => return errinput!("usage: get KEY"),

            ("delete", [key]) => {
                let command = KvCommand::Delete { key: parse_bytes(key)? };
                let applied = self.raft.apply(command.encode(), WRITE_TIMEOUT).wait()?;
                println!("ok (index {})", applied.index);
            }
            ("delete", _) => return errinput!("usage: delete KEY"),

            ("add-voter", [id, address]) => {
                let applied = self.raft.add_voter(*id, *address, 0, WRITE_TIMEOUT).wait()?;
                println!("added voter {id} (index {})", applied.index);
            }
            ("add-voter", _) => return errinput!("usage: add-voter ID ADDRESS"),

            ("add-nonvoter", [id, address]) => {
                let applied = self.raft.add_nonvoter(*id, *address, 0, WRITE_TIMEOUT).wait()?;
                println!("added nonvoter {id} (index {})", applied.index);
            }
            ("add-nonvoter", _) => return errinput!("usage: add-nonvoter ID ADDRESS"),

            ("demote", [id]) => {
                let applied = self.raft.demote_voter(*id, 0, WRITE_TIMEOUT).wait()?;
                println!("demoted {id} (index {})", applied.index);
            }
            ("demote", _) => return errinput!("usage: demote ID"),

            ("remove", [id]) => {
                let applied = self.raft.remove_server(*id, 0, WRITE_TIMEOUT).wait()?;
                println!("removed {id} (index {})", applied.index);
            }
            ("remove", _) => return errinput!("usage: remove ID"),

            ("transfer", []) => {
                self.raft.leadership_transfer().wait()?;
                println!("leadership transferred");
            }
            ("transfer", [id, address]) => {
                self.raft.leadership_transfer_to_server(*id, *address).wait()?;
                println!("leadership transferred to {id}");
            }
            ("transfer", _) => return errinput!("usage: transfer [ID ADDRESS]"),

            ("snapshot", []) => {
                let snapshot = self.raft.snapshot().wait()?;
                println!("created snapshot {}", snapshot.id());
            }
            ("snapshot", _) => return errinput!("snapshot takes no arguments"),

            ("stats", []) => print!("{}", self.raft.stats()),
            ("stats", _) => return errinput!("stats takes no arguments"),

            ("config", []) => {
                let configurations = self.raft.get_configuration().wait()?;
                println!(
                    "committed at {}, latest at {}",
                    configurations.committed_index, configurations.latest_index
                );
                for server in &configurations.latest.servers {
                    println!("{server}");
                }
            }
            ("config", _) => return errinput!("config takes no arguments"),

            ("bootstrap", []) => {
                let configuration = self.bootstrap_configuration();
                self.raft.bootstrap_cluster(configuration).wait()?;
                println!("bootstrapped cluster");
            }
            ("bootstrap", _) => return errinput!("bootstrap takes no arguments"),

            ("help", _) => println!(
                r#"
Enter a command, or Ctrl-D to exit. Keys and values are strings, or hex bytes
prefixed with 0x. The following commands are available:

    set KEY VALUE              Sets a key (on the leader)
    get KEY                    Reads a key from the local replica
    delete KEY                 Deletes a key (on the leader)
    add-voter ID ADDRESS       Adds a voter
    add-nonvoter ID ADDRESS    Adds a nonvoter
    demote ID                  Demotes a voter to nonvoter
    remove ID                  Removes a server
    transfer [ID ADDRESS]      Transfers leadership
    snapshot                   Takes a snapshot
    stats                      Displays node statistics
    config                     Displays the cluster configuration
    bootstrap                  Bootstraps the cluster from the configured peers
    help                       This help message
"#
            ),

            (command, _) => return errinput!("unknown command {command}, try help"),
        }
        Ok(())
    }

    /// Returns the bootstrap configuration: the configured peers and the
    /// local node.
    fn bootstrap_configuration(&self) -> Configuration {
        let local_address =
            self.cfg.advertise.clone().unwrap_or_else(|| self.cfg.listen.clone());
        let servers = self
            .cfg
            .peers
            .iter()
            .filter(|(id, _)| **id != self.cfg.id)
            .map(|(id, address)| Server::voter(id.as_str(), address.as_str()))
            .chain(std::iter::once(Server::voter(self.cfg.id.as_str(), local_address)))
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect();
        Configuration::new(servers)
    }

    /// Prompts the user for a command.
    fn prompt(&mut self) -> Result<Option<String>> {
        let prompt = format!("{}:{}> ", self.raft.local_id(), self.raft.state());
        match self.editor.readline(&prompt) {
            Ok(input) => {
                self.editor.add_history_entry(&input)?;
                Ok(Some(input.trim().to_string()))
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs the interactive shell.
    fn run(&mut self) -> Result<()> {
        if let Some(history_path) = &self.history_path {
            match self.editor.load_history(history_path) {
                Ok(_) => {}
                Err(ReadlineError::Io(ref err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            };
        }

        while let Some(input) = self.prompt()? {
            if let Err(error) = self.execute(&input) {
                eprintln!("Error: {error}");
            }
        }

        if let Some(history_path) = &self.history_path {
            self.editor.save_history(history_path)?;
        }
        Ok(())
    }
}

/// Parses a shell argument as bytes: hex if prefixed with 0x, otherwise the
/// raw string.
fn parse_bytes(arg: &str) -> Result<Vec<u8>> {
    match arg.strip_prefix("0x") {
        Some(hex) => Ok(hex::decode(hex)?),
        None => Ok(arg.as_bytes().to_vec()),
    }
}

/// Formats bytes as a string if valid UTF-8, otherwise as 0x-prefixed hex.
fn format_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", hex::encode(bytes)),
    }
}

