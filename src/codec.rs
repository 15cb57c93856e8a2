use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::command::Command;
use crate::reply::{ParseError, Reply};
use crate::Error;

/// Default upper bound for the bytes buffered while waiting for one reply frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// RESP2 codec: encodes commands as multi-bulk arrays and decodes reply frames.
///
/// A frame is only consumed from the read buffer once it parsed completely, so a frame
/// is never split between two reads.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_frame_size: usize,
}

impl RespCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor) {
            Ok(reply) => reply,
            Err(ParseError::Incomplete) => {
                // Protect against a peer announcing an unbounded frame.
                if src.len() > self.max_frame_size {
                    return Err(ParseError::FrameTooLarge(self.max_frame_size).into());
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let position = cursor.position() as usize;
        trace!(bytes = position, "decoded reply frame");

        // Remove the parsed frame from the buffer.
        src.advance(position);

        Ok(Some(reply))
    }
}

impl<T> Encoder<&Command<T>> for RespCodec {
    type Error = Error;

    fn encode(&mut self, command: &Command<T>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        command.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decode_frames_one_at_a_time() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n:2\r\n$5\r\nhel"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Status("OK".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Reply::Integer(2)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // The partial frame stays buffered until the rest arrives.
        assert_eq!(&buf[..], b"$5\r\nhel");
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Bulk(Some(Bytes::from("hello"))))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_prefix() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(ParseError::InvalidDataType(b'?'))));
        assert!(err.is_fatal());
    }

    #[test]
    fn decode_enforces_max_frame_size() {
        let mut codec = RespCodec::new(8);
        let mut buf = BytesMut::from(&b"$100\r\n0123456789"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ParseError::FrameTooLarge(8)))
        ));
    }

    #[test]
    fn encode_command() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();
        let cmd: Command = Command::new("GET").arg("key");

        codec.encode(&cmd, &mut buf).unwrap();

        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encode_then_decode_arbitrary_payloads() {
        use rand::{Rng, RngCore};

        let mut rng = rand::thread_rng();
        let mut codec = RespCodec::default();

        for _ in 0..64 {
            let mut payload = vec![0u8; rng.gen_range(0..512)];
            rng.fill_bytes(&mut payload);

            let cmd: Command = Command::new("SET").arg("key").arg(payload.clone());
            let mut buf = BytesMut::new();
            codec.encode(&cmd, &mut buf).unwrap();

            // A request is itself a valid array of bulk strings.
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(
                decoded,
                Reply::Array(Some(vec![
                    Reply::Bulk(Some(Bytes::from("SET"))),
                    Reply::Bulk(Some(Bytes::from("key"))),
                    Reply::Bulk(Some(Bytes::from(payload))),
                ]))
            );
        }
    }
}
