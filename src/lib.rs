pub mod buffer_pool;
pub mod codec;
pub mod command;
pub mod commands;
pub mod config;
pub mod connection;
pub mod connector;
pub mod event;
pub mod io_queue;
pub mod pipeline;
pub mod pubsub;
pub mod reply;
pub mod transaction;
pub mod transport;

pub use command::{Arg, Command};
pub use config::Config;
pub use connection::Connection;
pub use connector::{AsyncConnector, ConnectorState};
pub use event::{Event, Message, SubscriptionChanged};
pub use pubsub::{PushKind, Subscriber};
pub use reply::{FromReply, Replies, Reply};
pub use transaction::Transaction;

use thiserror::Error as ThisError;

/// Errors surfaced by the client.
///
/// Protocol violations and transport failures leave the stream position unknown, so the
/// connection that produced them refuses every later operation with [`Error::Tainted`].
/// Server errors and usage errors only concern the command that triggered them.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The server answered with an error reply (`-ERR ...`).
    #[error("server error: {0}")]
    Server(String),

    /// The byte stream did not follow RESP framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] reply::ParseError),

    /// A frame decoded fine but its type does not fit the requested projection.
    #[error("protocol error; unexpected reply, expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A previous protocol or transport failure left the stream unusable.
    #[error("connection is unusable after a previous failure: {0}")]
    Tainted(String),

    /// The request was rejected locally before any byte was sent.
    #[error("usage error: {0}")]
    Usage(String),
}

impl Error {
    /// Whether the stream position is lost after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Io(_)
                | Error::ConnectionClosed
                | Error::Timeout(_)
                | Error::Tainted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
