// https://redis.io/docs/reference/protocol-spec

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;

use bytes::{Buf, Bytes};
use std::io::Cursor;
use std::str;
use thiserror::Error as ThisError;

use crate::Error;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest array nesting accepted in one frame.
const MAX_NESTING: usize = 128;

/// Errors raised while parsing a reply frame out of a byte buffer.
#[derive(Debug, ThisError, PartialEq)]
pub enum ParseError {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("invalid length {0}")]
    InvalidLength(i64),
    #[error("invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("bulk string is not terminated by CRLF")]
    MissingTerminator,
    #[error("frame exceeds the limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error("arrays nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("invalid UTF-8 in a line frame")]
    InvalidUtf8(#[from] str::Utf8Error),
}

/// A single decoded RESP2 value.
///
/// Null bulk strings (`$-1`) and null arrays (`*-1`) are kept apart from their empty
/// counterparts (`$0`, `*0`).
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, ParseError> {
        Self::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, ParseError> {
        // The first byte in an RESP-serialized payload always identifies its type.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::Status => {
                let line = get_line(src)?;
                Ok(Reply::Status(str::from_utf8(line)?.to_string()))
            }
            DataType::Error => {
                let line = get_line(src)?;
                Ok(Reply::Error(str::from_utf8(line)?.to_string()))
            }
            DataType::Integer => Ok(Reply::Integer(get_integer(src)?)),
            // $<length>\r\n<data>\r\n
            DataType::Bulk => match get_length(src)? {
                None => Ok(Reply::Bulk(None)),
                Some(length) => {
                    let data = get_exact(src, length)?;
                    Ok(Reply::Bulk(Some(Bytes::copy_from_slice(data))))
                }
            },
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array if depth >= MAX_NESTING => Err(ParseError::TooDeep(MAX_NESTING)),
            DataType::Array => match get_length(src)? {
                None => Ok(Reply::Array(None)),
                Some(length) => {
                    // Never trust the announced length for the allocation, the elements
                    // may still be in flight.
                    let mut replies = Vec::with_capacity(length.min(src.remaining()));
                    for _ in 0..length {
                        replies.push(Self::parse_nested(src, depth + 1)?);
                    }
                    Ok(Reply::Array(Some(replies)))
                }
            },
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.serialize_into(&mut bytes);
        bytes
    }

    fn serialize_into(&self, bytes: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                bytes.push(u8::from(DataType::Status));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                bytes.push(u8::from(DataType::Error));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Integer(i) => {
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(i.to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Reply::Bulk(None) => bytes.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                bytes.push(u8::from(DataType::Bulk));
                bytes.extend_from_slice(data.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Reply::Array(None) => bytes.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(replies)) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(replies.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                for reply in replies {
                    reply.serialize_into(bytes);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    /// Lossy text view of status, error, integer and bulk replies.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Reply::Status(s) | Reply::Error(s) => Some(s.clone()),
            Reply::Integer(i) => Some(i.to_string()),
            Reply::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(Some(_)) => "bulk",
            Reply::Bulk(None) => "null bulk",
            Reply::Array(Some(_)) => "array",
            Reply::Array(None) => "null array",
        }
    }
}

impl From<Reply> for Vec<u8> {
    fn from(reply: Reply) -> Self {
        reply.serialize()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(Some(bytes)) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Reply::Bulk(None) | Reply::Array(None) => write!(f, "(nil)"),
            Reply::Array(Some(replies)) if replies.is_empty() => write!(f, "(empty array)"),
            Reply::Array(Some(replies)) => {
                for (i, reply) in replies.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, reply)?;
                }
                Ok(())
            }
        }
    }
}

/// Typed projection of a decoded reply.
///
/// A top-level error reply always projects to [`Error::Server`], whatever the target type.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> Result<Self, Error>;
}

fn unexpected(expected: &'static str, actual: &Reply) -> Error {
    Error::UnexpectedReply {
        expected,
        actual: actual.kind(),
    }
}

impl FromReply for Reply {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Ok(reply),
        }
    }
}

impl FromReply for () {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        Reply::from_reply(reply).map(|_| ())
    }
}

impl FromReply for String {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Status(s) => Ok(s),
            Reply::Bulk(Some(bytes)) => String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::UnexpectedReply {
                    expected: "UTF-8 text",
                    actual: "binary bulk",
                }),
            Reply::Integer(i) => Ok(i.to_string()),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("text", &reply)),
        }
    }
}

impl FromReply for Bytes {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Bulk(Some(bytes)) => Ok(bytes),
            Reply::Status(s) => Ok(Bytes::from(s)),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("bulk", &reply)),
        }
    }
}

impl FromReply for Vec<u8> {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        Bytes::from_reply(reply).map(|bytes| bytes.to_vec())
    }
}

impl FromReply for i64 {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Integer(i) => Ok(i),
            Reply::Bulk(Some(ref bytes)) => str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| unexpected("integer", &reply)),
            Reply::Status(ref s) => s.parse().map_err(|_| unexpected("integer", &reply)),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("integer", &reply)),
        }
    }
}

impl FromReply for u64 {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Integer(i) => u64::try_from(i).map_err(|_| unexpected("unsigned integer", &reply)),
            Reply::Bulk(Some(ref bytes)) => str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| unexpected("unsigned integer", &reply)),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("unsigned integer", &reply)),
        }
    }
}

impl FromReply for f64 {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Integer(i) => Ok(i as f64),
            Reply::Bulk(Some(ref bytes)) => str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| unexpected("float", &reply)),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("float", &reply)),
        }
    }
}

impl FromReply for bool {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Integer(i) => Ok(i != 0),
            Reply::Status(ref s) if s == "OK" => Ok(true),
            Reply::Bulk(None) => Ok(false),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("integer or OK", &reply)),
        }
    }
}

impl<T: FromReply> FromReply for Option<T> {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Bulk(None) | Reply::Array(None) => Ok(None),
            reply => T::from_reply(reply).map(Some),
        }
    }
}

impl<T: FromReply> FromReply for Vec<T> {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Array(Some(replies)) => replies.into_iter().map(T::from_reply).collect(),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("array", &reply)),
        }
    }
}

/// Flat `[field, value, field, value, ...]` arrays such as the HGETALL reply.
impl<K, V> FromReply for HashMap<K, V>
where
    K: FromReply + Eq + Hash,
    V: FromReply,
{
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Array(Some(replies)) if replies.len() % 2 == 0 => {
                let mut map = HashMap::with_capacity(replies.len() / 2);
                let mut replies = replies.into_iter();
                while let (Some(key), Some(value)) = (replies.next(), replies.next()) {
                    map.insert(K::from_reply(key)?, V::from_reply(value)?);
                }
                Ok(map)
            }
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("array of field/value pairs", &reply)),
        }
    }
}

impl<A: FromReply, B: FromReply> FromReply for (A, B) {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Array(Some(replies)) if replies.len() == 2 => {
                let mut replies = replies.into_iter();
                match (replies.next(), replies.next()) {
                    (Some(a), Some(b)) => Ok((A::from_reply(a)?, B::from_reply(b)?)),
                    _ => Err(Error::UnexpectedReply {
                        expected: "two element array",
                        actual: "array",
                    }),
                }
            }
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("two element array", &reply)),
        }
    }
}

/// Array elements exactly as received. Unlike `Vec<Reply>`, error elements stay in place
/// as [`Reply::Error`], which is what the EXEC reply needs: one failed command must not hide
/// the results of the others.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Replies(pub Vec<Reply>);

impl Replies {
    pub fn into_vec(self) -> Vec<Reply> {
        self.0
    }
}

impl Deref for Replies {
    type Target = [Reply];

    fn deref(&self) -> &[Reply] {
        &self.0
    }
}

impl IntoIterator for Replies {
    type Item = Reply;
    type IntoIter = std::vec::IntoIter<Reply>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromReply for Replies {
    fn from_reply(reply: Reply) -> Result<Self, Error> {
        match reply {
            Reply::Array(Some(replies)) => Ok(Replies(replies)),
            Reply::Error(msg) => Err(Error::Server(msg)),
            reply => Err(unexpected("array", &reply)),
        }
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the bytes up to the next CRLF and moves the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buffer: &'a [u8] = *src.get_ref();

    let end = buffer[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(ParseError::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buffer[start..end])
}

fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let line = str::from_utf8(get_line(src)?)?;
    line.parse::<i64>()
        .map_err(|_| ParseError::InvalidInteger(line.to_string()))
}

/// Reads a bulk or array length. `None` is the RESP2 null marker (-1).
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, ParseError> {
    match get_integer(src)? {
        -1 => Ok(None),
        length if length < 0 => Err(ParseError::InvalidLength(length)),
        length => Ok(Some(length as usize)),
    }
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, length: usize) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buffer: &'a [u8] = *src.get_ref();

    if buffer.len() < start + length + CRLF.len() {
        return Err(ParseError::Incomplete);
    }
    if &buffer[start + length..start + length + CRLF.len()] != CRLF {
        return Err(ParseError::MissingTerminator);
    }

    src.set_position((start + length + CRLF.len()) as u64);

    Ok(&buffer[start..start + length])
}

#[derive(Debug)]
enum DataType {
    Status,  // '+'
    Error,   // '-'
    Integer, // ':'
    Bulk,    // '$'
    Array,   // '*'
}

impl TryFrom<u8> for DataType {
    type Error = ParseError;

    fn try_from(byte: u8) -> Result<Self, ParseError> {
        match byte {
            b'+' => Ok(DataType::Status),
            b'-' => Ok(DataType::Error),
            b':' => Ok(DataType::Integer),
            b'$' => Ok(DataType::Bulk),
            b'*' => Ok(DataType::Array),
            _ => Err(ParseError::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Status => b'+',
            DataType::Error => b'-',
            DataType::Integer => b':',
            DataType::Bulk => b'$',
            DataType::Array => b'*',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Result<Reply, ParseError> {
        let mut cursor = Cursor::new(data);
        Reply::parse(&mut cursor)
    }

    #[test]
    fn parse_status() {
        assert_eq!(parse(b"+PONG\r\n"), Ok(Reply::Status("PONG".to_string())));
    }

    #[test]
    fn parse_error() {
        assert_eq!(
            parse(b"-ERR unknown command\r\n"),
            Ok(Reply::Error("ERR unknown command".to_string()))
        );
    }

    #[test]
    fn parse_integers() {
        assert_eq!(parse(b":2\r\n"), Ok(Reply::Integer(2)));
        assert_eq!(parse(b":-1000\r\n"), Ok(Reply::Integer(-1000)));
        assert_eq!(parse(b":+7\r\n"), Ok(Reply::Integer(7)));
        assert_eq!(
            parse(b":abc\r\n"),
            Err(ParseError::InvalidInteger("abc".to_string()))
        );
    }

    #[test]
    fn parse_bulk_null_is_not_empty() {
        assert_eq!(parse(b"$-1\r\n"), Ok(Reply::Bulk(None)));
        assert_eq!(parse(b"$0\r\n\r\n"), Ok(Reply::Bulk(Some(Bytes::new()))));
    }

    #[test]
    fn parse_array_null_is_not_empty() {
        assert_eq!(parse(b"*-1\r\n"), Ok(Reply::Array(None)));
        assert_eq!(parse(b"*0\r\n"), Ok(Reply::Array(Some(vec![]))));
    }

    #[test]
    fn parse_bulk_is_binary_safe() {
        let reply = parse(b"$4\r\na\r\nb\r\n").unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"a\r\nb"))));
    }

    #[test]
    fn parse_bulk_with_multibyte_content() {
        let reply = parse("$2\r\né\r\n".as_bytes()).unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from("é"))));
    }

    #[test]
    fn parse_bulk_missing_terminator() {
        assert_eq!(parse(b"$3\r\nfooXY"), Err(ParseError::MissingTerminator));
    }

    #[test]
    fn parse_scan_reply() {
        let data = b"*2\r\n$1\r\n0\r\n*3\r\n$5\r\ntest1\r\n$5\r\ntest2\r\n$5\r\ntest3\r\n";
        let reply = parse(data).unwrap();

        let (cursor, keys): (i64, Vec<String>) = FromReply::from_reply(reply).unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(keys, vec!["test1", "test2", "test3"]);
    }

    #[test]
    fn parse_nested_arrays_with_nulls() {
        let data = b"*3\r\n*2\r\n:1\r\n+QUEUED\r\n$-1\r\n*-1\r\n";
        let reply = parse(data).unwrap();

        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Array(Some(vec![
                    Reply::Integer(1),
                    Reply::Status("QUEUED".to_string())
                ])),
                Reply::Bulk(None),
                Reply::Array(None),
            ]))
        );
    }

    #[test]
    fn parse_incomplete() {
        assert_eq!(parse(b""), Err(ParseError::Incomplete));
        assert_eq!(parse(b"+OK"), Err(ParseError::Incomplete));
        assert_eq!(parse(b"$5\r\nhel"), Err(ParseError::Incomplete));
        assert_eq!(parse(b"*2\r\n:1\r\n"), Err(ParseError::Incomplete));
    }

    #[test]
    fn parse_invalid_prefix() {
        assert_eq!(parse(b"%1\r\n"), Err(ParseError::InvalidDataType(b'%')));
        assert_eq!(parse(b"$-2\r\n"), Err(ParseError::InvalidLength(-2)));
    }

    #[test]
    fn serialize_matches_wire_format() {
        let reply = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from("0"))),
            Reply::Array(Some(vec![Reply::Integer(3), Reply::Bulk(None)])),
        ]));

        assert_eq!(reply.serialize(), b"*2\r\n$1\r\n0\r\n*2\r\n:3\r\n$-1\r\n".to_vec());
    }

    #[test]
    fn project_flat_pairs_into_map() {
        let reply = parse(b"*4\r\n$2\r\nf1\r\n$2\r\nv1\r\n$2\r\nf2\r\n$2\r\nv2\r\n").unwrap();
        let map: HashMap<String, String> = FromReply::from_reply(reply).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map["f1"], "v1");
        assert_eq!(map["f2"], "v2");
    }

    #[test]
    fn project_errors_and_nulls() {
        let err = String::from_reply(Reply::Error("WRONGTYPE".to_string())).unwrap_err();
        assert!(matches!(err, Error::Server(ref msg) if msg == "WRONGTYPE"));

        let value: Option<String> = FromReply::from_reply(Reply::Bulk(None)).unwrap();
        assert_eq!(value, None);

        let err = i64::from_reply(Reply::Array(Some(vec![]))).unwrap_err();
        assert!(matches!(err, Error::UnexpectedReply { .. }));
    }

    #[test]
    fn data_type_from_prefix() {
        assert!(matches!(DataType::try_from(b'-'), Ok(DataType::Error)));
        assert!(matches!(DataType::try_from(b'*'), Ok(DataType::Array)));
        assert_eq!(u8::from(DataType::Bulk), b'$');
        assert!(matches!(
            DataType::try_from(b'#'),
            Err(ParseError::InvalidDataType(b'#'))
        ));
    }

    #[test]
    fn parse_rejects_runaway_nesting() {
        let mut nested = b"*1\r\n".repeat(MAX_NESTING);
        nested.extend_from_slice(b":1\r\n");
        assert!(parse(&nested).is_ok());

        let too_deep = b"*1\r\n".repeat(100_000);
        assert_eq!(parse(&too_deep), Err(ParseError::TooDeep(MAX_NESTING)));
    }

    #[test]
    fn replies_keep_element_errors() {
        let reply = parse(b"*2\r\n+OK\r\n-ERR value is not an integer\r\n").unwrap();
        let replies = Replies::from_reply(reply).unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], Reply::Status("OK".to_string()));
        assert!(replies[1].is_error());

        let err = Replies::from_reply(Reply::Error("EXECABORT".to_string())).unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }
}
