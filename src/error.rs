use serde::{Deserialize, Serialize};

/// replog errors. Most variants are distinct kinds that callers are expected
/// to match on (e.g. retrying on LeadershipLost or redirecting on NotLeader).
/// The string variants wrap lower-level failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A user restore aborted the pending operation.
    AbortedByRestore,
    /// The local state already exists, so the cluster can't be bootstrapped.
    CantBootstrap,
    /// The configuration changed since the given index (optimistic
    /// concurrency check for membership changes).
    ConfigurationChanged { since: u64, latest: u64 },
    /// The caller's timeout elapsed before the operation was enqueued.
    EnqueueTimeout,
    /// An IO error.
    IO(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically configuration or membership errors.
    InvalidInput(String),
    /// The operation was accepted by the leader, but leadership was lost
    /// before it committed.
    LeadershipLost,
    /// A leadership transfer is in progress, so the operation was rejected.
    LeadershipTransferInProgress,
    /// The requested log index does not exist, e.g. because it was compacted.
    LogNotFound,
    /// The operation requires the leader role.
    NotLeader,
    /// The local server is not a voter.
    NotVoter,
    /// The FSM has no new state since the last snapshot.
    NothingNewToSnapshot,
    /// The transport does not support pipelined replication.
    PipelineReplicationNotSupported,
    /// The pipeline was shut down.
    PipelineShutdown,
    /// The node is shutting down.
    RaftShutdown,
    /// A leadership transfer did not complete within the election timeout.
    TransferTimeout,
    /// The transport was shut down.
    TransportShutdown,
    /// The operation requires a different protocol version.
    UnsupportedProtocol,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AbortedByRestore => write!(f, "abort requested by restore operation"),
            Error::CantBootstrap => write!(f, "bootstrap only works on new clusters"),
            Error::ConfigurationChanged { since, latest } => {
                write!(f, "configuration changed since {since} (latest is {latest})")
            }
            Error::EnqueueTimeout => write!(f, "timed out enqueuing operation"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::LeadershipLost => write!(f, "leadership lost while committing log"),
            Error::LeadershipTransferInProgress => write!(f, "leadership transfer in progress"),
            Error::LogNotFound => write!(f, "log not found"),
            Error::NotLeader => write!(f, "node is not the leader"),
            Error::NotVoter => write!(f, "node is not a voter"),
            Error::NothingNewToSnapshot => write!(f, "nothing new to snapshot"),
            Error::PipelineReplicationNotSupported => {
                write!(f, "pipeline replication not supported")
            }
            Error::PipelineShutdown => write!(f, "append pipeline closed"),
            Error::RaftShutdown => write!(f, "raft is already shutdown"),
            Error::TransferTimeout => write!(f, "leadership transfer timeout"),
            Error::TransportShutdown => write!(f, "transport shutdown"),
            Error::UnsupportedProtocol => {
                write!(f, "operation not supported with current protocol version")
            }
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A replog Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        match *err {
            bincode::ErrorKind::Io(err) => Error::IO(err.to_string()),
            err => Error::InvalidData(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::RaftShutdown
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::RaftShutdown
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bincode_io_errors_map_to_io() {
        let err: Box<bincode::ErrorKind> = Box::new(bincode::ErrorKind::Io(
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"),
        ));
        assert_eq!(Error::from(err), Error::IO("pipe".into()));
    }

    #[test]
    fn macros_build_string_variants() {
        let result: Result<()> = errinput!("bad {}", 1);
        assert_eq!(result, Err(Error::InvalidInput("bad 1".into())));
        let result: Result<()> = errdata!("corrupt");
        assert_eq!(result, Err(Error::InvalidData("corrupt".into())));
    }
}
