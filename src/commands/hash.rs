use std::collections::HashMap;

use bytes::Bytes;

use crate::command::{Arg, Command};

/// Sets `field` in the hash stored at `key`. Returns the number of fields added.
///
/// Ref: <https://redis.io/docs/latest/commands/hset>
pub fn hset(key: impl Into<Arg>, field: impl Into<Arg>, value: impl Into<Arg>) -> Command<i64> {
    Command::new("HSET").arg(key).arg(field).arg(value)
}

/// Ref: <https://redis.io/docs/latest/commands/hget>
pub fn hget(key: impl Into<Arg>, field: impl Into<Arg>) -> Command<Option<Bytes>> {
    Command::new("HGET").arg(key).arg(field)
}

/// Removes the specified fields from the hash stored at `key`. Returns the number of
/// fields that were removed.
///
/// Ref: <https://redis.io/docs/latest/commands/hdel>
pub fn hdel<I, A>(key: impl Into<Arg>, fields: I) -> Command<i64>
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    Command::new("HDEL").arg(key).args(fields)
}

/// Ref: <https://redis.io/docs/latest/commands/hgetall>
pub fn hgetall(key: impl Into<Arg>) -> Command<HashMap<String, Bytes>> {
    Command::new("HGETALL").arg(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::Reply;

    #[test]
    fn hdel_matches_wire_format() {
        assert_eq!(
            hdel("test", ["test1", "test2"]).to_bytes(),
            Bytes::from_static(b"*4\r\n$4\r\nHDEL\r\n$4\r\ntest\r\n$5\r\ntest1\r\n$5\r\ntest2\r\n")
        );
        assert_eq!(hdel("test", ["a"]).parse_reply(Reply::Integer(2)).unwrap(), 2);
    }

    #[test]
    fn hgetall_builds_map() {
        let reply = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from("name"))),
            Reply::Bulk(Some(Bytes::from("resp-client"))),
        ]));

        let map = hgetall("h").parse_reply(reply).unwrap();
        assert_eq!(map.get("name"), Some(&Bytes::from("resp-client")));
    }
}
