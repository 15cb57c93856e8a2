use crate::command::{Arg, Command};
use crate::reply::Replies;

/// Marks the start of a transaction block.
///
/// Ref: <https://redis.io/docs/latest/commands/multi>
pub fn multi() -> Command<()> {
    Command::new("MULTI")
}

/// Executes all previously queued commands. The reply is an array with one element per
/// queued command, or null when a watched key was modified. A command that failed at run
/// time shows up as a [`crate::Reply::Error`] element rather than failing the whole call.
///
/// Ref: <https://redis.io/docs/latest/commands/exec>
pub fn exec() -> Command<Option<Replies>> {
    Command::new("EXEC")
}

/// Ref: <https://redis.io/docs/latest/commands/discard>
pub fn discard() -> Command<()> {
    Command::new("DISCARD")
}

/// Makes the next EXEC conditional on none of `keys` being modified.
///
/// Ref: <https://redis.io/docs/latest/commands/watch>
pub fn watch<I, A>(keys: I) -> Command<()>
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("WATCH").args(keys)
}

/// Ref: <https://redis.io/docs/latest/commands/unwatch>
pub fn unwatch() -> Command<()> {
    Command::new("UNWATCH")
}
