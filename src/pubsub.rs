use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::command::{Arg, Command};
use crate::commands;
use crate::config::Config;
use crate::connection::{read_frame, Connection, Reader, Writer};
use crate::event::{self, Event, Message, SubscriptionChanged};
use crate::reply::Reply;
use crate::Error;

/// How long the background receive loop blocks on a read before checking for
/// cancellation, when no read timeout is configured.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// First element of every frame received in push mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PushKind {
    Subscribe,
    PSubscribe,
    Unsubscribe,
    PUnsubscribe,
    Message,
    PMessage,
    Pong,
}

impl PushKind {
    fn is_pattern(self) -> bool {
        matches!(self, PushKind::PSubscribe | PushKind::PUnsubscribe)
    }
}

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Per channel (or per pattern) callbacks. Registration takes the lock; dispatch only
/// holds it long enough to clone the matching callbacks.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    inner: Arc<Mutex<HashMap<String, Callback>>>,
}

impl Callbacks {
    fn register(&self, name: String, callback: Callback) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, callback);
    }

    fn remove(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    fn dispatch(&self, message: &Message) {
        let matching: Vec<Callback> = {
            let callbacks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let by_channel = callbacks.get(&message.channel);
            let by_pattern = message
                .pattern
                .as_ref()
                .and_then(|pattern| callbacks.get(pattern));
            by_channel.into_iter().chain(by_pattern).cloned().collect()
        };

        for callback in matching {
            callback(message);
        }
    }
}

/// Push mode bookkeeping of one connection.
#[derive(Default)]
pub(crate) struct SubscriptionState {
    active: bool,
    count: i64,
    pub(crate) callbacks: Callbacks,
}

impl SubscriptionState {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn count(&self) -> i64 {
        self.count
    }

    /// A subscription change was written; replies are push frames from now on.
    pub(crate) fn enter(&mut self) {
        self.active = true;
    }

    /// Classifies one push frame and updates the subscription count.
    ///
    /// Acknowledgements carry the server's count of remaining subscriptions; when it drops
    /// to zero the connection leaves push mode. `pong` frames yield no event.
    pub(crate) fn apply(&mut self, reply: Reply) -> Result<Option<Event>, Error> {
        let parts = match reply {
            Reply::Array(Some(parts)) => parts,
            Reply::Error(msg) => return Err(Error::Server(msg)),
            reply => {
                return Err(Error::UnexpectedReply {
                    expected: "push array",
                    actual: reply.kind(),
                })
            }
        };

        let mut parts = parts.into_iter();
        let kind = parts
            .next()
            .and_then(|reply| reply.as_text())
            .and_then(|kind| kind.parse::<PushKind>().ok())
            .ok_or(Error::UnexpectedReply {
                expected: "push kind",
                actual: "unknown push kind",
            })?;

        match kind {
            PushKind::Subscribe
            | PushKind::PSubscribe
            | PushKind::Unsubscribe
            | PushKind::PUnsubscribe => {
                let name = parts.next().and_then(|reply| reply.as_text());
                let count = match parts.next() {
                    Some(Reply::Integer(count)) => count,
                    _ => {
                        return Err(Error::UnexpectedReply {
                            expected: "subscription count",
                            actual: "missing count",
                        })
                    }
                };

                self.count = count.max(0);
                self.active = self.count > 0;

                let (channel, pattern) = if kind.is_pattern() {
                    (None, name)
                } else {
                    (name, None)
                };

                Ok(Some(Event::SubscriptionChanged(SubscriptionChanged {
                    kind,
                    channel,
                    pattern,
                    count: self.count,
                })))
            }
            PushKind::Message => {
                let channel = next_text(&mut parts, "channel")?;
                let payload = next_payload(&mut parts)?;

                Ok(Some(Event::MessageReceived(Message {
                    channel,
                    pattern: None,
                    payload,
                })))
            }
            PushKind::PMessage => {
                let pattern = next_text(&mut parts, "pattern")?;
                let channel = next_text(&mut parts, "channel")?;
                let payload = next_payload(&mut parts)?;

                Ok(Some(Event::MessageReceived(Message {
                    channel,
                    pattern: Some(pattern),
                    payload,
                })))
            }
            PushKind::Pong => Ok(None),
        }
    }
}

fn next_text(parts: &mut impl Iterator<Item = Reply>, what: &'static str) -> Result<String, Error> {
    parts
        .next()
        .and_then(|reply| reply.as_text())
        .ok_or(Error::UnexpectedReply {
            expected: what,
            actual: "missing element",
        })
}

fn next_payload(parts: &mut impl Iterator<Item = Reply>) -> Result<Bytes, Error> {
    match parts.next() {
        Some(Reply::Bulk(Some(payload))) => Ok(payload),
        Some(Reply::Status(payload)) => Ok(Bytes::from(payload)),
        _ => Err(Error::UnexpectedReply {
            expected: "message payload",
            actual: "missing element",
        }),
    }
}

impl Connection {
    pub async fn subscribe<I, A>(&mut self, channels: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.change_subscription(&commands::subscribe(channels)).await
    }

    pub async fn psubscribe<I, A>(&mut self, patterns: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.change_subscription(&commands::psubscribe(patterns)).await
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    pub async fn unsubscribe<I, A>(&mut self, channels: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.change_subscription(&commands::unsubscribe(channels)).await
    }

    /// Unsubscribes from `patterns`, or from every pattern when empty.
    pub async fn punsubscribe<I, A>(&mut self, patterns: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.change_subscription(&commands::punsubscribe(patterns)).await
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_active()
    }

    pub fn subscription_count(&self) -> i64 {
        self.subscription.count()
    }

    /// Registers a callback for messages on `name`, a channel or a subscribed pattern.
    pub fn on_message<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscription
            .callbacks
            .register(name.into(), Arc::new(callback));
    }

    pub fn remove_callback(&mut self, name: &str) -> bool {
        self.subscription.callbacks.remove(name)
    }

    async fn change_subscription(&mut self, command: &Command) -> Result<(), Error> {
        self.ensure_usable()?;
        if self.pipeline.is_active() || self.transaction.is_active() {
            return Err(Error::Usage(format!(
                "{} is not allowed inside a pipeline or transaction",
                command.name()
            )));
        }

        self.send(command).await?;

        if !self.subscription.is_active() {
            self.subscription.enter();
            debug!(connection_id = %self.id, "entered push mode");
        }
        Ok(())
    }

    /// Reads push frames until one produces an event and returns it. Callbacks are not
    /// invoked; see [`Connection::listen`].
    pub async fn next_push(&mut self) -> Result<Event, Error> {
        loop {
            self.ensure_usable()?;
            if !self.subscription.is_active() {
                return Err(Error::Usage("connection is not subscribed".to_string()));
            }

            let reply = self.read_reply().await?;
            if let Some(event) = self.subscription.apply(reply)? {
                return Ok(event);
            }
        }
    }

    /// Runs the receive loop until the subscription count returns to zero or `cancel`
    /// fires. Events go to the channel installed with [`Connection::events`] and messages
    /// to the registered callbacks.
    ///
    /// Cancellation is checked between frames only. A read timeout is treated as "no
    /// data" while the connection is still up.
    pub async fn listen(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        while self.subscription.is_active() {
            self.ensure_usable()?;
            if cancel.is_cancelled() {
                debug!(connection_id = %self.id, "receive loop cancelled");
                return Ok(());
            }

            let reply = match read_frame(&mut self.reader, self.config.read_timeout).await {
                Ok(reply) => reply,
                Err(Error::Timeout(_)) if self.connected => continue,
                Err(err) => return Err(self.fail(err)),
            };

            if let Some(event) = self.subscription.apply(reply)? {
                if let Event::MessageReceived(ref message) = event {
                    self.subscription.callbacks.dispatch(message);
                }
                self.notify(event);
            }
        }

        debug!(connection_id = %self.id, "left push mode");
        Ok(())
    }
}

/// A subscription client whose receive loop runs on a background task for the
/// connection's whole lifetime.
///
/// Subscribing and unsubscribing go through a shared write half, so they can be issued
/// from any task while the loop keeps reading. When the count drops to zero the
/// connection leaves push mode but the loop keeps waiting for the next subscription.
///
/// Dropping the subscriber stops the loop and closes the connection; use
/// [`Subscriber::shutdown`] to learn how the loop ended.
pub struct Subscriber {
    id: Uuid,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    callbacks: Callbacks,
    count: Arc<AtomicI64>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl Subscriber {
    pub async fn connect(config: Config) -> Result<(Subscriber, mpsc::Receiver<Event>), Error> {
        let conn = Connection::connect(config).await?;
        Subscriber::spawn(conn)
    }

    /// Moves `conn` into a background receive loop. Subscriptions already made on the
    /// connection carry over.
    pub fn spawn(conn: Connection) -> Result<(Subscriber, mpsc::Receiver<Event>), Error> {
        conn.ensure_usable()?;
        if conn.in_pipeline() || conn.in_transaction() {
            return Err(Error::Usage(
                "can not subscribe with an active pipeline or transaction".to_string(),
            ));
        }

        let Connection {
            id,
            config,
            reader,
            writer,
            subscription,
            ..
        } = conn;

        let (events, rx) = mpsc::channel(config.event_capacity);
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicI64::new(subscription.count()));
        let callbacks = subscription.callbacks.clone();

        let receive_loop = ReceiveLoop {
            reader,
            state: subscription,
            events,
            count: count.clone(),
            cancel: cancel.clone(),
            poll_interval: config.read_timeout.unwrap_or(DEFAULT_POLL_INTERVAL),
        };
        let task = tokio::spawn(
            receive_loop
                .run()
                .instrument(info_span!("subscriber", connection_id = %id)),
        );

        let subscriber = Subscriber {
            id,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            callbacks,
            count,
            cancel,
            task: Some(task),
        };
        Ok((subscriber, rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn subscribe<I, A>(&self, channels: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.send(&commands::subscribe(channels)).await
    }

    pub async fn psubscribe<I, A>(&self, patterns: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.send(&commands::psubscribe(patterns)).await
    }

    pub async fn unsubscribe<I, A>(&self, channels: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.send(&commands::unsubscribe(channels)).await
    }

    pub async fn punsubscribe<I, A>(&self, patterns: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.send(&commands::punsubscribe(patterns)).await
    }

    /// Registers a callback for messages on `name`, a channel or a subscribed pattern.
    /// Callbacks run on the receive loop task.
    pub fn on_message<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.callbacks.register(name.into(), Arc::new(callback));
    }

    pub fn remove_callback(&self, name: &str) -> bool {
        self.callbacks.remove(name)
    }

    /// Subscription count as of the last acknowledgement processed by the loop.
    pub fn subscription_count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription_count() > 0
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Keeps an idle subscription alive. The `pong` push frame is consumed by the loop.
    pub async fn ping(&self) -> Result<(), Error> {
        self.send(&Command::new("PING")).await
    }

    async fn send(&self, command: &Command) -> Result<(), Error> {
        if !command.is_allowed_in_push_mode() {
            return Err(Error::Usage(format!(
                "{} is not allowed on a subscriber",
                command.name()
            )));
        }
        if self.cancel.is_cancelled() || !self.is_running() {
            return Err(Error::Tainted("subscriber is shut down".to_string()));
        }

        debug!(connection_id = %self.id, command = %command, "writing subscription change");
        let mut writer = self.writer.lock().await;
        writer.send(command).await
    }

    /// Stops the receive loop and closes the connection. A read failing because of this
    /// close is not reported as an error.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        self.cancel.cancel();

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = SinkExt::<&Command>::close(&mut *writer).await {
                debug!(connection_id = %self.id, error = %err, "closing write half failed");
            }
        }

        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, err))),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The loop owns the read half; aborting it releases the socket right away instead
        // of after the next poll interval.
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(connection_id = %self.id, "subscriber dropped");
        }
    }
}

struct ReceiveLoop {
    reader: Reader,
    state: SubscriptionState,
    events: mpsc::Sender<Event>,
    count: Arc<AtomicI64>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ReceiveLoop {
    async fn run(mut self) -> Result<(), Error> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("receive loop cancelled");
                return Ok(());
            }

            let reply = match read_frame(&mut self.reader, Some(self.poll_interval)).await {
                Ok(reply) => reply,
                // Nothing arrived, the connection is still up.
                Err(Error::Timeout(_)) => continue,
                Err(err) if self.cancel.is_cancelled() => {
                    debug!(error = %err, "read interrupted by shutdown");
                    return Ok(());
                }
                Err(err) => {
                    error!(error = %err, "receive loop failed");
                    return Err(err);
                }
            };

            let was_active = self.state.is_active();
            match self.state.apply(reply) {
                Ok(Some(event)) => {
                    self.count.store(self.state.count(), Ordering::SeqCst);
                    if let Event::MessageReceived(ref message) = event {
                        self.state.callbacks.dispatch(message);
                    }
                    event::deliver(&self.events, event);
                }
                Ok(None) => {}
                Err(Error::Server(msg)) => warn!(error = %msg, "subscription command rejected"),
                Err(err) => {
                    error!(error = %err, "unexpected frame in push mode");
                    return Err(err);
                }
            }

            if was_active && !self.state.is_active() {
                debug!("left push mode");
            } else if !was_active && self.state.is_active() {
                debug!("entered push mode");
            }
        }
    }
}
