use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::codec::RespCodec;
use crate::command::{encode_token, encoded_token_len, Command};
use crate::commands;
use crate::config::Config;
use crate::connection::{read_frame, Reader};
use crate::io_queue::{IoQueue, PendingCommand};
use crate::reply::FromReply;
use crate::transport::{self, Stream};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl From<u8> for ConnectorState {
    fn from(state: u8) -> Self {
        match state {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// A connection shared by many concurrent callers.
///
/// Replies are matched to commands purely by position: the server answers in the order
/// it received commands, and the internal IO queue records that order. Writes and reads
/// happen under separate locks, so a caller can be sending while another is waiting for
/// its reply.
///
/// MULTI/EXEC/DISCARD and subscription commands change how later replies must be read
/// and are refused here; use [`crate::Connection`] or [`crate::Subscriber`] for those.
#[derive(Clone)]
pub struct AsyncConnector {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    config: Config,
    state: AtomicU8,
    // Shared by every caller; the first one opens the stream, the others await it.
    link: OnceCell<Link>,
    queue: IoQueue,
    buffers: BufferPool,
    tainted: StdMutex<Option<String>>,
}

struct Link {
    writer: Mutex<WriteHalf<Stream>>,
    reader: Mutex<Reader>,
}

impl AsyncConnector {
    /// Builds a connector that opens its stream on the first call.
    pub fn new(config: Config) -> Result<AsyncConnector, Error> {
        config.validate()?;

        let buffers = BufferPool::new(config.transfer_buffer_size, config.transfer_buffer_count);
        let inner = Inner {
            id: Uuid::new_v4(),
            config,
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            link: OnceCell::new(),
            queue: IoQueue::default(),
            buffers,
            tainted: StdMutex::new(None),
        };

        Ok(AsyncConnector {
            inner: Arc::new(inner),
        })
    }

    /// Builds a connector and opens its stream right away.
    pub async fn connect(config: Config) -> Result<AsyncConnector, Error> {
        let connector = AsyncConnector::new(config)?;
        connector.inner.link().await?;
        Ok(connector)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_tainted(&self) -> bool {
        self.inner.tainted_reason().is_some()
    }

    /// Commands written or waiting to be written whose reply has not arrived yet.
    pub async fn pending(&self) -> usize {
        self.inner.queue.len().await
    }

    /// Free transfer buffers; zero means the next caller waits.
    pub fn available_buffers(&self) -> usize {
        self.inner.buffers.available()
    }

    /// Sends `command` and resolves with its reply projected into `T`.
    ///
    /// Waits for a transfer buffer when all of them are in use. A command with a token
    /// larger than one transfer buffer is refused before anything is written.
    #[instrument(name = "call_async", skip(self, command), fields(connector_id = %self.inner.id, command = %command.name()))]
    pub async fn call_async<T: FromReply>(&self, command: &Command<T>) -> Result<T, Error> {
        self.inner.ensure_usable()?;

        if command.is_multi() || command.is_exec() || command.is_discard() {
            return Err(Error::Usage(format!(
                "{} is not supported on the async connector; use Connection::multi",
                command.name()
            )));
        }
        if command.is_subscription_change() {
            return Err(Error::Usage(format!(
                "{} is not supported on the async connector; use Subscriber",
                command.name()
            )));
        }
        let largest = command.max_token_len();
        if largest > self.inner.buffers.buffer_size() {
            return Err(Error::Usage(format!(
                "argument of {} bytes does not fit the {} byte transfer buffer",
                largest,
                self.inner.buffers.buffer_size()
            )));
        }

        self.inner.link().await?;

        let buffer = match self.inner.buffers.acquire().await {
            Ok(buffer) => buffer,
            Err(err) => return Err(self.inner.tainted_error().unwrap_or(err)),
        };

        let (pending, reply) = PendingCommand::new(command.erase());
        self.inner.queue.enqueue(pending).await;

        // Driven on its own task so a caller dropping this future can not leave a written
        // command without its reply being consumed.
        tokio::spawn(self.inner.clone().drive(buffer));

        let reply = match reply.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionClosed),
        };
        command.parse_reply(reply)
    }

    /// Fails every pending command and shuts the write half down.
    pub async fn close(&self) -> Result<(), Error> {
        let reason = "closed by client";
        self.inner.taint(reason);
        self.inner.buffers.close();
        self.inner.queue.fail_all(reason).await;

        if let Some(link) = self.inner.link.get() {
            link.writer.lock().await.shutdown().await?;
        }

        debug!(connector_id = %self.inner.id, "connector closed");
        Ok(())
    }
}

impl Inner {
    fn tainted_reason(&self) -> Option<String> {
        self.tainted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tainted_error(&self) -> Option<Error> {
        self.tainted_reason().map(Error::Tainted)
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        match self.tainted_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Marks the connector unusable. The first reason sticks.
    fn taint(&self, reason: &str) {
        self.tainted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| reason.to_string());
        self.state
            .store(ConnectorState::Disconnected as u8, Ordering::SeqCst);
    }

    async fn link(&self) -> Result<&Link, Error> {
        self.ensure_usable()?;

        self.link
            .get_or_try_init(|| async {
                self.state
                    .store(ConnectorState::Connecting as u8, Ordering::SeqCst);

                match self.open().await {
                    Ok(link) => {
                        self.state
                            .store(ConnectorState::Connected as u8, Ordering::SeqCst);
                        info!(connector_id = %self.id, "connected");
                        Ok(link)
                    }
                    Err(err) => {
                        warn!(connector_id = %self.id, error = %err, "connect failed");
                        self.taint(&err.to_string());
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn open(&self) -> Result<Link, Error> {
        let stream = transport::connect(&self.config).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, RespCodec::new(self.config.max_frame_size));

        if let Some(ref password) = self.config.password {
            debug!(connector_id = %self.id, "replaying AUTH");
            let auth = commands::auth(password);
            write_half.write_all(&auth.to_bytes()).await?;
            write_half.flush().await?;
            let reply = read_frame(&mut reader, self.config.read_timeout).await?;
            auth.parse_reply(reply)?;
        }

        Ok(Link {
            writer: Mutex::new(write_half),
            reader: Mutex::new(reader),
        })
    }

    /// Writes the oldest queued command, then reads the oldest outstanding reply.
    ///
    /// Every drive writes exactly one command and reads exactly one reply, so the reply
    /// read here may belong to another caller; it always belongs to the head of the read
    /// queue.
    async fn drive(self: Arc<Self>, buffer: PooledBuffer) {
        if let Err(err) = self.round_trip(buffer).await {
            self.fail(&err.to_string()).await;
        }
    }

    /// Taints the connector and fails everything still queued.
    async fn fail(&self, reason: &str) {
        warn!(connector_id = %self.id, error = %reason, "connector tainted");
        self.taint(reason);
        self.buffers.close();
        self.queue.fail_all(reason).await;
    }

    async fn round_trip(&self, mut buffer: PooledBuffer) -> Result<(), Error> {
        let link = self.link().await?;

        {
            let mut writer = link.writer.lock().await;
            let Some(command) = self.queue.dequeue_for_write().await else {
                return Ok(());
            };
            let capacity = self.buffers.buffer_size();
            write_command(&mut writer, &command, &mut buffer, capacity).await?;
        }
        drop(buffer);

        let mut reader = link.reader.lock().await;
        let Some(pending) = self.queue.dequeue_for_read().await else {
            return Ok(());
        };

        match read_frame(&mut reader, self.config.read_timeout).await {
            Ok(reply) => {
                pending.complete(Ok(reply));
                Ok(())
            }
            Err(err) => {
                // The stream position is lost; the owner sees the cause, the rest are
                // failed as tainted.
                self.fail(&err.to_string()).await;
                pending.complete(Err(err));
                Ok(())
            }
        }
    }
}

/// Serializes `command` through `buffer`, sending the buffered bytes whenever the next
/// token would not fit in `capacity`.
async fn write_command(
    writer: &mut WriteHalf<Stream>,
    command: &Command,
    buffer: &mut BytesMut,
    capacity: usize,
) -> Result<(), Error> {
    buffer.clear();
    command.encode_header(buffer);

    for token in command.tokens() {
        if buffer.len() + encoded_token_len(token) > capacity {
            writer.write_all(&buffer[..]).await?;
            buffer.clear();
        }
        encode_token(token, buffer);
    }

    writer.write_all(&buffer[..]).await?;
    writer.flush().await?;
    buffer.clear();
    Ok(())
}
