use tracing::debug;

use crate::command::Command;
use crate::connection::Connection;
use crate::reply::Reply;
use crate::Error;

/// Pipeline bookkeeping: whether writes are being batched and how many replies are owed.
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    active: bool,
    outstanding: usize,
}

impl PipelineState {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }
}

impl Connection {
    /// Starts batching: commands given to [`Connection::write`] are sent without waiting
    /// for their replies.
    pub fn start_pipeline(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        if self.pipeline.active {
            return Err(Error::Usage("a pipeline is already active".to_string()));
        }
        if self.subscription.is_active() {
            return Err(Error::Usage("can not pipeline while subscribed".to_string()));
        }

        self.pipeline = PipelineState {
            active: true,
            outstanding: 0,
        };
        Ok(())
    }

    pub fn in_pipeline(&self) -> bool {
        self.pipeline.active
    }

    /// Number of replies the pipeline still has to drain.
    pub fn outstanding(&self) -> usize {
        self.pipeline.outstanding
    }

    /// Writes `command` without reading its reply. Only valid inside a pipeline, which is
    /// the only place that accounts for the reply left on the stream.
    pub async fn write<T>(&mut self, command: &Command<T>) -> Result<(), Error> {
        self.ensure_usable()?;
        if !self.pipeline.active {
            return Err(Error::Usage(
                "write() needs an active pipeline; call start_pipeline() first".to_string(),
            ));
        }
        if command.is_subscription_change() {
            return Err(Error::Usage(format!(
                "{} can not be pipelined",
                command.name()
            )));
        }

        self.feed(command).await?;
        self.pipeline.outstanding += 1;
        Ok(())
    }

    /// Flushes the batch and reads one reply per written command, in submission order.
    /// Server errors stay in place as [`Reply::Error`] so positions keep matching.
    pub async fn end_pipeline(&mut self) -> Result<Vec<Reply>, Error> {
        let count = self.finish_pipeline().await?;

        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(self.read_reply().await?);
        }

        debug!(connection_id = %self.id, replies = count, "pipeline drained");
        Ok(replies)
    }

    /// Like [`Connection::end_pipeline`] but drops every reply instead of collecting them.
    pub async fn end_pipeline_ignored(&mut self) -> Result<(), Error> {
        let count = self.finish_pipeline().await?;

        for _ in 0..count {
            self.read_reply().await?;
        }

        debug!(connection_id = %self.id, replies = count, "pipeline drained, replies ignored");
        Ok(())
    }

    async fn finish_pipeline(&mut self) -> Result<usize, Error> {
        self.ensure_usable()?;
        if !self.pipeline.active {
            return Err(Error::Usage("no pipeline is active".to_string()));
        }

        let count = self.pipeline.outstanding;
        self.pipeline = PipelineState::default();

        self.flush().await?;
        Ok(count)
    }
}
