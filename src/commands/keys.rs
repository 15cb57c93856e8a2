use std::time::Duration;

use bytes::Bytes;

use crate::command::{Arg, Command};

/// Get the value of key. If the key does not exist the special value nil is returned.
///
/// Ref: <https://redis.io/docs/latest/commands/get>
pub fn get(key: impl Into<Arg>) -> Command<Option<Bytes>> {
    Command::new("GET").arg(key)
}

/// Set key to hold the string value, overwriting any previous value.
///
/// Ref: <https://redis.io/docs/latest/commands/set>
pub fn set(key: impl Into<Arg>, value: impl Into<Arg>) -> Command<()> {
    Command::new("SET").arg(key).arg(value)
}

/// SET with a millisecond precision expiry (`PX`).
pub fn set_ex(key: impl Into<Arg>, value: impl Into<Arg>, ttl: Duration) -> Command<()> {
    set(key, value).arg("PX").arg(ttl.as_millis() as u64)
}

/// Removes the specified keys and returns how many existed.
///
/// Ref: <https://redis.io/docs/latest/commands/del>
pub fn del<I, A>(keys: I) -> Command<i64>
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("DEL").args(keys)
}

/// Ref: <https://redis.io/docs/latest/commands/incr>
pub fn incr(key: impl Into<Arg>) -> Command<i64> {
    Command::new("INCR").arg(key)
}

/// Ref: <https://redis.io/docs/latest/commands/incrby>
pub fn incrby(key: impl Into<Arg>, increment: i64) -> Command<i64> {
    Command::new("INCRBY").arg(key).arg(increment)
}

/// Incrementally iterates the keyspace. The reply is the next cursor (`0` once the
/// iteration is complete) and the keys of this page.
///
/// Ref: <https://redis.io/docs/latest/commands/scan>
pub fn scan(cursor: u64) -> Command<(u64, Vec<String>)> {
    Command::new("SCAN").arg(cursor)
}
