use crate::command::{Arg, Command};

/// Posts a message to the given channel. Returns the number of clients that received it.
///
/// Ref: <https://redis.io/docs/latest/commands/publish>
pub fn publish(channel: impl Into<Arg>, message: impl Into<Arg>) -> Command<i64> {
    Command::new("PUBLISH").arg(channel).arg(message)
}

// The replies to the commands below are push frames handled by the subscription engine,
// so they keep the raw reply type.

/// Ref: <https://redis.io/docs/latest/commands/subscribe>
pub fn subscribe<I, A>(channels: I) -> Command
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("SUBSCRIBE").args(channels)
}

/// Ref: <https://redis.io/docs/latest/commands/psubscribe>
pub fn psubscribe<I, A>(patterns: I) -> Command
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("PSUBSCRIBE").args(patterns)
}

/// Without channels every channel subscription is dropped.
///
/// Ref: <https://redis.io/docs/latest/commands/unsubscribe>
pub fn unsubscribe<I, A>(channels: I) -> Command
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("UNSUBSCRIBE").args(channels)
}

/// Ref: <https://redis.io/docs/latest/commands/punsubscribe>
pub fn punsubscribe<I, A>(patterns: I) -> Command
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("PUNSUBSCRIBE").args(patterns)
}
