use std::fmt;
use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;

use crate::reply::{FromReply, Reply};

static CRLF: &[u8; 2] = b"\r\n";

/// A single command argument, already converted to its wire bytes.
///
/// Byte buffers pass through untouched, numbers use Rust's locale independent formatting
/// and text is sent as UTF-8.
#[derive(Clone, Debug, PartialEq)]
pub struct Arg(Bytes);

impl Arg {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Arg {
    fn from(bytes: Bytes) -> Self {
        Arg(bytes)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Arg(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Arg(Bytes::copy_from_slice(bytes))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(bytes: &[u8; N]) -> Self {
        Arg(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg(Bytes::from(s))
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg(Bytes::copy_from_slice(s.as_bytes()))
    }
}

macro_rules! arg_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg(Bytes::from(value.to_string()))
                }
            }
        )*
    };
}

arg_from_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, char);

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        // Redis spells infinities as `inf`/`-inf`, which is what `Display` produces.
        Arg(Bytes::from(value.to_string()))
    }
}

impl From<f32> for Arg {
    fn from(value: f32) -> Self {
        Arg::from(value as f64)
    }
}

/// Serialized size of one token: `$<len>\r\n<bytes>\r\n`.
pub fn encoded_token_len(token: &[u8]) -> usize {
    1 + token.len().to_string().len() + CRLF.len() + token.len() + CRLF.len()
}

pub fn encode_token(token: &[u8], dst: &mut BytesMut) {
    dst.put_u8(b'$');
    dst.put_slice(token.len().to_string().as_bytes());
    dst.put_slice(CRLF);
    dst.put_slice(token);
    dst.put_slice(CRLF);
}

/// An immutable request: a command name, its ordered arguments and the type its reply is
/// projected into.
///
/// The name may span several tokens (`"CLIENT KILL"`, `"CONFIG GET"`), each sent as its own
/// bulk string.
pub struct Command<T = Reply> {
    name: String,
    args: Vec<Arg>,
    parser: PhantomData<fn() -> T>,
}

impl<T> Command<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            parser: PhantomData,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// Every token sent on the wire: the name words followed by the arguments.
    pub fn tokens(&self) -> impl Iterator<Item = &[u8]> {
        self.name
            .split_whitespace()
            .map(str::as_bytes)
            .chain(self.args.iter().map(Arg::as_bytes))
    }

    pub fn token_count(&self) -> usize {
        self.name.split_whitespace().count() + self.args.len()
    }

    /// Uppercased first word of the name, used to classify the command.
    pub fn keyword(&self) -> String {
        self.name
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }

    /// Serialized size of the multi-bulk header: `*<n>\r\n`.
    pub fn encoded_header_len(&self) -> usize {
        1 + self.token_count().to_string().len() + CRLF.len()
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_header_len()
            + self
                .tokens()
                .map(encoded_token_len)
                .sum::<usize>()
    }

    /// Largest serialized token; no single token may exceed a transfer buffer.
    pub fn max_token_len(&self) -> usize {
        self.tokens()
            .map(encoded_token_len)
            .max()
            .unwrap_or(0)
            .max(self.encoded_header_len())
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.encode_header(dst);
        for token in self.tokens() {
            encode_token(token, dst);
        }
    }

    pub fn encode_header(&self, dst: &mut BytesMut) {
        dst.put_u8(b'*');
        dst.put_slice(self.token_count().to_string().as_bytes());
        dst.put_slice(CRLF);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst);
        dst.freeze()
    }

    pub fn is_multi(&self) -> bool {
        self.keyword() == "MULTI"
    }

    pub fn is_exec(&self) -> bool {
        self.keyword() == "EXEC"
    }

    pub fn is_discard(&self) -> bool {
        self.keyword() == "DISCARD"
    }

    /// Commands that change the subscribed set.
    pub fn is_subscription_change(&self) -> bool {
        matches!(
            self.keyword().as_str(),
            "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE"
        )
    }

    /// Commands a connection in push mode still accepts.
    pub fn is_allowed_in_push_mode(&self) -> bool {
        self.is_subscription_change() || matches!(self.keyword().as_str(), "PING" | "QUIT")
    }

    /// Drops the reply type, keeping name and arguments.
    pub fn erase(&self) -> Command<Reply> {
        Command {
            name: self.name.clone(),
            args: self.args.clone(),
            parser: PhantomData,
        }
    }
}

impl<T: FromReply> Command<T> {
    pub fn parse_reply(&self, reply: Reply) -> crate::Result<T> {
        T::from_reply(reply)
    }
}

impl<T> Clone for Command<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            args: self.args.clone(),
            parser: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .finish()
    }
}

impl<T> fmt::Display for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg.as_bytes()).into_owned())
            .join(" ");

        if args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ping() {
        let cmd: Command = Command::new("PING");
        assert_eq!(cmd.to_bytes(), Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
        assert_eq!(cmd.encoded_len(), cmd.to_bytes().len());
    }

    #[test]
    fn encode_hdel() {
        let cmd: Command<i64> = Command::new("HDEL").arg("test").args(["test1", "test2"]);
        assert_eq!(
            cmd.to_bytes(),
            Bytes::from_static(b"*4\r\n$4\r\nHDEL\r\n$4\r\ntest\r\n$5\r\ntest1\r\n$5\r\ntest2\r\n")
        );
    }

    #[test]
    fn encode_splits_multi_word_names() {
        let cmd: Command = Command::new("CLIENT KILL").arg("127.0.0.1:6380");
        assert_eq!(cmd.token_count(), 3);
        assert_eq!(
            cmd.to_bytes(),
            Bytes::from_static(b"*3\r\n$6\r\nCLIENT\r\n$4\r\nKILL\r\n$14\r\n127.0.0.1:6380\r\n")
        );
        assert_eq!(cmd.keyword(), "CLIENT");
    }

    #[test]
    fn encode_counts_bytes_not_chars() {
        let cmd: Command = Command::new("SET").arg("key").arg("é");
        let bytes = cmd.to_bytes();
        assert!(bytes.ends_with("$2\r\né\r\n".as_bytes()));
        assert_eq!(cmd.encoded_len(), bytes.len());
    }

    #[test]
    fn encode_numbers_and_bytes() {
        let cmd: Command = Command::new("ZADD")
            .arg("z")
            .arg(1.5)
            .arg(-3i64)
            .arg(f64::INFINITY)
            .arg(&[0u8, 13, 10, 255]);
        let args: Vec<&[u8]> = cmd.arguments().iter().map(Arg::as_bytes).collect();
        assert_eq!(
            args,
            vec![&b"z"[..], &b"1.5"[..], &b"-3"[..], &b"inf"[..], &[0u8, 13, 10, 255][..]]
        );
    }

    #[test]
    fn classify_commands() {
        assert!(Command::<Reply>::new("multi").is_multi());
        assert!(Command::<Reply>::new("Exec").is_exec());
        assert!(Command::<Reply>::new("DISCARD").is_discard());
        assert!(Command::<Reply>::new("psubscribe").is_subscription_change());
        assert!(Command::<Reply>::new("PING").is_allowed_in_push_mode());
        assert!(!Command::<Reply>::new("GET").is_allowed_in_push_mode());
    }

    #[test]
    fn max_token_len_covers_largest_argument() {
        let cmd: Command = Command::new("SET").arg("k").arg(vec![b'x'; 100]);
        assert_eq!(cmd.max_token_len(), 1 + 3 + 2 + 100 + 2);
    }

    #[test]
    fn display_joins_arguments() {
        let cmd: Command = Command::new("SET").arg("k").arg(1);
        assert_eq!(cmd.to_string(), "SET k 1");
    }
}
