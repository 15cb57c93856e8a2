use std::collections::VecDeque;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::command::Command;
use crate::reply::Reply;
use crate::Error;

/// A command waiting for its turn on the wire, paired with the channel its reply is
/// delivered on.
pub(crate) struct PendingCommand {
    pub(crate) command: Command,
    reply: oneshot::Sender<Result<Reply, Error>>,
}

impl PendingCommand {
    pub(crate) fn new(command: Command) -> (Self, oneshot::Receiver<Result<Reply, Error>>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }

    /// Delivers the outcome. The caller may have given up waiting, which is fine.
    pub(crate) fn complete(self, result: Result<Reply, Error>) {
        let _ = self.reply.send(result);
    }
}

/// FIFO correlation of written commands and read replies.
///
/// Commands enter the write queue in submission order. Whoever holds the write lock
/// moves the head to the tail of the read queue right before writing it, so the read
/// queue always lists written commands in wire order and the next reply belongs to its
/// head.
#[derive(Default)]
pub(crate) struct IoQueue {
    write: Mutex<VecDeque<PendingCommand>>,
    read: Mutex<VecDeque<PendingCommand>>,
}

impl IoQueue {
    pub(crate) async fn enqueue(&self, pending: PendingCommand) {
        self.write.lock().await.push_back(pending);
    }

    /// Moves the oldest unwritten command to the read queue and returns what to write.
    pub(crate) async fn dequeue_for_write(&self) -> Option<Command> {
        let mut write = self.write.lock().await;
        let pending = write.pop_front()?;
        let command = pending.command.clone();

        // Registered before the bytes go out so the reply can never overtake it.
        self.read.lock().await.push_back(pending);
        Some(command)
    }

    /// Oldest written command still waiting for its reply.
    pub(crate) async fn dequeue_for_read(&self) -> Option<PendingCommand> {
        self.read.lock().await.pop_front()
    }

    /// Completes every queued command with [`Error::Tainted`].
    pub(crate) async fn fail_all(&self, reason: &str) {
        let mut write = self.write.lock().await;
        let mut read = self.read.lock().await;

        let failed = write.len() + read.len();
        for pending in read.drain(..).chain(write.drain(..)) {
            pending.complete(Err(Error::Tainted(reason.to_string())));
        }

        if failed > 0 {
            debug!(failed, reason, "failed pending commands");
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.write.lock().await.len() + self.read.lock().await.len()
    }
}
