use bytes::Bytes;

use crate::command::{Arg, Command};

/// Returns PONG; the status reply is projected into a string.
///
/// Ref: <https://redis.io/docs/latest/commands/ping>
pub fn ping() -> Command<String> {
    Command::new("PING")
}

/// Returns `message` back as a bulk string.
///
/// Ref: <https://redis.io/docs/latest/commands/echo>
pub fn echo(message: impl Into<Arg>) -> Command<Bytes> {
    Command::new("ECHO").arg(message)
}

/// Authenticates the connection with the `requirepass` password.
///
/// Ref: <https://redis.io/docs/latest/commands/auth>
pub fn auth(password: impl Into<Arg>) -> Command<()> {
    Command::new("AUTH").arg(password)
}

/// Ref: <https://redis.io/docs/latest/commands/select>
pub fn select(index: u32) -> Command<()> {
    Command::new("SELECT").arg(index)
}

/// Asks the server to close the connection once it replied.
///
/// Ref: <https://redis.io/docs/latest/commands/quit>
pub fn quit() -> Command<()> {
    Command::new("QUIT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_matches_wire_format() {
        assert_eq!(ping().to_bytes(), Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
    }

    #[test]
    fn select_formats_index() {
        assert_eq!(
            select(3).to_bytes(),
            Bytes::from_static(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n")
        );
    }
}
