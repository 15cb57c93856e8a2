//! Typed builders for the commands the client itself relies on, plus a handful of common
//! data commands. Anything else can be built with [`crate::Command::new`].

mod connection;
mod hash;
mod keys;
mod pubsub;
mod transaction;

pub use connection::{auth, echo, ping, quit, select};
pub use hash::{hdel, hget, hgetall, hset};
pub use keys::{del, get, incr, incrby, scan, set, set_ex};
pub use pubsub::{psubscribe, publish, punsubscribe, subscribe, unsubscribe};
pub use transaction::{discard, exec, multi, unwatch, watch};
