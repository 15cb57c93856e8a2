use tracing::debug;

use crate::command::Command;
use crate::commands;
use crate::connection::Connection;
use crate::event::Event;
use crate::reply::{FromReply, Reply};
use crate::Error;

/// Whether MULTI was sent and neither EXEC nor DISCARD has closed it yet.
#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    active: bool,
}

impl TransactionState {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }
}

impl Connection {
    /// Sends MULTI and returns a handle queueing commands until EXEC or DISCARD.
    ///
    /// The handle borrows the connection mutably, so no other caller can interleave
    /// commands with the transaction.
    pub async fn multi(&mut self) -> Result<Transaction<'_>, Error> {
        self.call(&commands::multi()).await?;
        Ok(Transaction {
            conn: self,
            queued: 0,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_active()
    }

    pub(crate) async fn begin_transaction<T>(
        &mut self,
        command: &Command<T>,
    ) -> Result<Reply, Error> {
        if self.transaction.is_active() {
            return Err(Error::Usage("MULTI calls can not be nested".to_string()));
        }

        self.send(command).await?;
        let reply = self.read_reply().await?;
        if !reply.is_error() {
            self.transaction.active = true;
            debug!(connection_id = %self.id, "transaction started");
        }
        Ok(reply)
    }

    /// Writes a command inside MULTI and reads back only its acknowledgement (`QUEUED`).
    ///
    /// Commands that change the transaction or push mode state are refused before anything
    /// is written; EXEC and DISCARD go through [`Connection::call`] or [`Transaction`].
    pub async fn queue<T>(&mut self, command: &Command<T>) -> Result<String, Error> {
        self.ensure_usable()?;
        if !self.transaction.is_active() {
            return Err(Error::Usage("no transaction is active".to_string()));
        }
        if command.is_multi()
            || command.is_exec()
            || command.is_discard()
            || command.is_subscription_change()
        {
            return Err(Error::Usage(format!("{} can not be queued", command.name())));
        }

        self.send(command).await?;
        match self.read_reply().await? {
            Reply::Status(status) => {
                self.notify(Event::TransactionQueued(status.clone()));
                Ok(status)
            }
            // Rejected at queue time, EXEC will abort the whole transaction.
            Reply::Error(msg) => Err(Error::Server(msg)),
            _ => Err(self.fail(Error::UnexpectedReply {
                expected: "status",
                actual: "non status reply",
            })),
        }
    }

    /// Sends EXEC and returns the per-command replies in queue order, `None` when the
    /// server aborted the transaction (a WATCHed key changed).
    pub(crate) async fn exec_transaction<T>(
        &mut self,
        command: &Command<T>,
    ) -> Result<Option<Vec<Reply>>, Error> {
        self.send(command).await?;
        self.transaction.active = false;

        match self.read_reply().await? {
            Reply::Array(replies) => {
                debug!(connection_id = %self.id, aborted = replies.is_none(), "transaction executed");
                Ok(replies)
            }
            Reply::Error(msg) => Err(Error::Server(msg)),
            _ => Err(Error::UnexpectedReply {
                expected: "array",
                actual: "non array reply",
            }),
        }
    }

    pub(crate) async fn discard_transaction<T>(&mut self, command: &Command<T>) -> Result<(), Error> {
        self.send(command).await?;
        self.transaction.active = false;

        let reply = self.read_reply().await?;
        debug!(connection_id = %self.id, "transaction discarded");
        <()>::from_reply(reply)
    }
}

/// An open MULTI block on a [`Connection`].
///
/// Dropping the handle without calling [`Transaction::exec`] or
/// [`Transaction::discard`] leaves the server side transaction open; the connection keeps
/// queueing until one of them is sent.
pub struct Transaction<'a> {
    conn: &'a mut Connection,
    queued: usize,
}

impl<'a> Transaction<'a> {
    /// Queues `command`, returning the server acknowledgement (`QUEUED`).
    pub async fn queue<T>(&mut self, command: &Command<T>) -> Result<String, Error> {
        let status = self.conn.queue(command).await?;
        self.queued += 1;
        Ok(status)
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Runs the queued commands. Each element is the raw reply of one queued command, in
    /// queue order; errors of individual commands stay as [`Reply::Error`] elements.
    pub async fn exec(self) -> Result<Option<Vec<Reply>>, Error> {
        self.conn.exec_transaction(&commands::exec()).await
    }

    pub async fn discard(self) -> Result<(), Error> {
        self.conn.discard_transaction(&commands::discard()).await
    }
}
