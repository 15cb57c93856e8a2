use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::codec::RespCodec;
use crate::command::Command;
use crate::commands;
use crate::config::Config;
use crate::event::{self, Event};
use crate::pipeline::PipelineState;
use crate::pubsub::SubscriptionState;
use crate::reply::{FromReply, Reply};
use crate::transaction::TransactionState;
use crate::transport::{self, Stream};
use crate::Error;

pub(crate) type Reader = FramedRead<ReadHalf<Stream>, RespCodec>;
pub(crate) type Writer = FramedWrite<WriteHalf<Stream>, RespCodec>;

/// One RESP connection used by a single caller at a time.
///
/// Commands are written and their replies read on the calling task, so the exclusive
/// borrow is what keeps replies in order. The connection never reconnects: after a
/// transport failure or a protocol violation every operation returns [`Error::Tainted`]
/// and a new connection has to be built.
pub struct Connection {
    pub id: Uuid,
    pub(crate) config: Config,
    // Replies are decoded from the read half. When a frame is parsed, the corresponding
    // data is removed from the read buffer.
    pub(crate) reader: Reader,
    pub(crate) writer: Writer,
    pub(crate) connected: bool,
    pub(crate) tainted: Option<String>,
    pub(crate) transaction: TransactionState,
    pub(crate) pipeline: PipelineState,
    pub(crate) subscription: SubscriptionState,
    pub(crate) events: Option<mpsc::Sender<Event>>,
}

impl Connection {
    /// Opens a stream to `config.addr()` and replays AUTH when a password is configured.
    pub async fn connect(config: Config) -> Result<Connection, Error> {
        let stream = transport::connect(&config).await?;
        let mut conn = Connection::new(stream, config);

        info!(connection_id = %conn.id, "connected");

        conn.authenticate().await?;
        Ok(conn)
    }

    pub fn new(stream: impl Into<Stream>, config: Config) -> Connection {
        let (read_half, write_half) = tokio::io::split(stream.into());
        let codec = RespCodec::new(config.max_frame_size);

        Connection {
            id: Uuid::new_v4(),
            reader: FramedRead::new(read_half, codec.clone()),
            writer: FramedWrite::new(write_half, codec),
            config,
            connected: true,
            tainted: None,
            transaction: TransactionState::default(),
            pipeline: PipelineState::default(),
            subscription: SubscriptionState::default(),
            events: None,
        }
    }

    async fn authenticate(&mut self) -> Result<(), Error> {
        let Some(password) = self.config.password.clone() else {
            return Ok(());
        };

        debug!(connection_id = %self.id, "replaying AUTH");
        self.call(&commands::auth(password)).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.tainted.is_none()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Installs a bounded channel receiving subscription and transaction notifications.
    /// A previously returned receiver stops getting events.
    pub fn events(&mut self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.config.event_capacity);
        self.events = Some(tx);
        rx
    }

    /// Writes `command` and waits for its reply, projected into `T`.
    ///
    /// MULTI, EXEC and DISCARD switch the transaction state. While a transaction is active
    /// the server only acknowledges other commands, so they have no reply of type `T`;
    /// `call` refuses them and they go through [`Connection::queue`] instead.
    #[instrument(name = "call", skip(self, command), fields(connection_id = %self.id, command = %command.name()))]
    pub async fn call<T: FromReply>(&mut self, command: &Command<T>) -> Result<T, Error> {
        self.ensure_usable()?;

        if self.subscription.is_active() {
            return Err(Error::Usage(format!(
                "{} is not allowed while subscribed; use the subscribe/unsubscribe methods",
                command.name()
            )));
        }
        if command.is_subscription_change() {
            return Err(Error::Usage(format!(
                "{} changes push mode; use the subscribe/unsubscribe methods",
                command.name()
            )));
        }
        if self.pipeline.is_active() {
            return Err(Error::Usage(
                "a pipeline is active; use write() and end_pipeline()".to_string(),
            ));
        }

        let reply = if command.is_multi() {
            self.begin_transaction(command).await?
        } else if command.is_exec() && self.transaction.is_active() {
            Reply::Array(self.exec_transaction(command).await?)
        } else if command.is_discard() && self.transaction.is_active() {
            self.discard_transaction(command).await?;
            Reply::Status("OK".to_string())
        } else if self.transaction.is_active() {
            return Err(Error::Usage(format!(
                "{} inside MULTI only gets a QUEUED acknowledgement; use queue()",
                command.name()
            )));
        } else {
            self.send(command).await?;
            self.read_reply().await?
        };

        command.parse_reply(reply)
    }

    /// Reads exactly one frame and projects it into `T`.
    pub async fn read<T: FromReply>(&mut self) -> Result<T, Error> {
        self.ensure_usable()?;
        T::from_reply(self.read_reply().await?)
    }

    /// Shuts the write half down. The connection is unusable afterwards.
    pub async fn close(&mut self) -> Result<(), Error> {
        if !self.connected {
            return Ok(());
        }

        self.connected = false;
        self.tainted.get_or_insert_with(|| "closed by client".to_string());
        SinkExt::<&Command>::close(&mut self.writer).await?;

        debug!(connection_id = %self.id, "connection closed");
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), Error> {
        match self.tainted {
            Some(ref reason) => Err(Error::Tainted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Records fatal errors so later operations fail fast.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            warn!(connection_id = %self.id, error = %err, "connection tainted");
            self.tainted = Some(err.to_string());
            if matches!(err, Error::Io(_) | Error::ConnectionClosed) {
                self.connected = false;
            }
        }
        err
    }

    /// Writes and flushes one command.
    pub(crate) async fn send<T>(&mut self, command: &Command<T>) -> Result<(), Error> {
        debug!(connection_id = %self.id, command = %command.name(), "writing command");
        match self.writer.send(command).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Buffers one command without flushing.
    pub(crate) async fn feed<T>(&mut self, command: &Command<T>) -> Result<(), Error> {
        match self.writer.feed(command).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        match SinkExt::<&Command>::flush(&mut self.writer).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Reads one raw frame, honouring the read timeout. Error frames are returned as
    /// [`Reply::Error`]; only framing and transport problems are errors here.
    pub(crate) async fn read_reply(&mut self) -> Result<Reply, Error> {
        match read_frame(&mut self.reader, self.config.read_timeout).await {
            Ok(reply) => Ok(reply),
            Err(err) => Err(self.fail(err)),
        }
    }

    pub(crate) fn notify(&self, event: Event) {
        if let Some(ref events) = self.events {
            event::deliver(events, event);
        }
    }
}

/// Pulls exactly one frame from `reader`.
pub(crate) async fn read_frame(
    reader: &mut Reader,
    read_timeout: Option<Duration>,
) -> Result<Reply, Error> {
    let next = match read_timeout {
        Some(duration) => timeout(duration, reader.next())
            .await
            .map_err(|_| Error::Timeout(duration))?,
        None => reader.next().await,
    };

    match next {
        Some(reply) => reply,
        None => Err(Error::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Accepts one client and answers every chunk it reads with the next canned reply.
    async fn serve(replies: Vec<&'static str>) -> (Connection, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            for reply in replies {
                let mut buf = [0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        (Connection::new(stream, Config::default()), server)
    }

    #[tokio::test]
    async fn ping() {
        let (mut conn, server) = serve(vec!["+PONG\r\n"]).await;

        let pong: String = conn.call(&commands::ping()).await.unwrap();

        assert_eq!(pong, "PONG");
        assert_eq!(server.await.unwrap(), b"*1\r\n$4\r\nPING\r\n".to_vec());
    }

    #[tokio::test]
    async fn server_error_keeps_connection_usable() {
        let (mut conn, _server) = serve(vec!["-ERR wrong\r\n", "$3\r\nbar\r\n"]).await;

        let err = conn.call(&commands::get("foo")).await.unwrap_err();
        assert!(matches!(err, Error::Server(ref msg) if msg == "ERR wrong"));
        assert!(conn.is_connected());

        let value = conn.call(&commands::get("foo")).await.unwrap();
        assert_eq!(value, Some(Bytes::from("bar")));
    }

    #[tokio::test]
    async fn protocol_violation_taints_connection() {
        let (mut conn, _server) = serve(vec!["&bogus\r\n"]).await;

        let err = conn.call(&commands::ping()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = conn.call(&commands::ping()).await.unwrap_err();
        assert!(matches!(err, Error::Tainted(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn subscription_commands_go_through_subscribe() {
        let (mut conn, _server) = serve(vec![]).await;

        let err = conn.call(&commands::subscribe(["news"])).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
