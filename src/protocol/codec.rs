use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

/// Upper bound on a single buffered message. Project sources and artifacts
/// travel inline, so this is generous.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("Connection closed by peer")]
    Closed,
}

/// Self-delimiting JSON object stream.
///
/// Objects are written back to back; a newline follows each one on encode but
/// the decoder never relies on it, so the stream interoperates with any
/// streaming JSON encoder. `D` is the type this side decodes; any
/// `Serialize` value can be encoded.
///
/// The decoder finds the end of an object or array by scanning only bytes it
/// has not seen before, and parses the frame once it is complete.
pub struct JsonCodec<D> {
    max_frame_len: usize,
    scan: FrameScan,
    _decodes: PhantomData<fn() -> D>,
}

/// Progress through the frame at the front of the read buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FrameScan {
    /// Bytes of the current frame already examined.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScan {
    /// Advance over `bytes[self.scanned..]`. Returns the frame length once the
    /// outermost container closes.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate().skip(self.scanned) {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        self.scanned = bytes.len();
        None
    }
}

impl<D> JsonCodec<D> {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            scan: FrameScan::default(),
            _decodes: PhantomData,
        }
    }

    /// Same limits and scan progress, different decoded type. Used after the
    /// handshake.
    pub fn retarget<T>(self) -> JsonCodec<T> {
        JsonCodec {
            max_frame_len: self.max_frame_len,
            scan: self.scan,
            _decodes: PhantomData,
        }
    }

    fn too_large(&self) -> ProtocolError {
        ProtocolError::FrameTooLarge {
            max: self.max_frame_len,
        }
    }
}

impl<D> Default for JsonCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned> Decoder for JsonCodec<D> {
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, ProtocolError> {
        if self.scan.scanned == 0 {
            let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(leading);
        }
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        // Bare scalars have no closing delimiter; they are short, so let the
        // parser find their end.
        if first != b'{' && first != b'[' {
            return self.decode_scalar(src);
        }

        let Some(len) = self.scan.advance(src) else {
            if src.len() > self.max_frame_len {
                return Err(self.too_large());
            }
            return Ok(None);
        };
        self.scan = FrameScan::default();
        if len > self.max_frame_len {
            return Err(self.too_large());
        }

        let frame = src.split_to(len);
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<D: DeserializeOwned> JsonCodec<D> {
    fn decode_scalar(&mut self, src: &mut BytesMut) -> Result<Option<D>, ProtocolError> {
        let (item, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<D>();
            match stream.next() {
                Some(Ok(item)) => (item, stream.byte_offset()),
                Some(Err(e)) if e.is_eof() => {
                    if src.len() > self.max_frame_len {
                        return Err(self.too_large());
                    }
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        };

        src.advance(consumed);
        Ok(Some(item))
    }
}

impl<D, T: Serialize> Encoder<T> for JsonCodec<D> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                max: self.max_frame_len,
            });
        }
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

pub type FrameReader<R, T> = FramedRead<R, JsonCodec<T>>;
pub type FrameWriter<W> = FramedWrite<W, JsonCodec<()>>;

pub fn frame_reader<R: AsyncRead, T>(inner: R) -> FrameReader<R, T> {
    FramedRead::new(inner, JsonCodec::new())
}

pub fn frame_writer<W: AsyncWrite>(inner: W) -> FrameWriter<W> {
    FramedWrite::new(inner, JsonCodec::new())
}

/// Switch a reader to the next message type without losing buffered bytes.
pub fn retarget_reader<R, A, B>(reader: FrameReader<R, A>) -> FrameReader<R, B>
where
    R: AsyncRead,
{
    reader.map_decoder(|codec| codec.retarget::<B>())
}

/// Read exactly one message. A clean EOF is reported as [`ProtocolError::Closed`].
pub async fn read_frame<R, T>(reader: &mut FrameReader<R, T>) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match reader.next().await {
        Some(item) => item,
        None => Err(ProtocolError::Closed),
    }
}

pub async fn write_frame<W, T>(writer: &mut FrameWriter<W>, item: T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.send(item).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn decodes_back_to_back_objects_without_separator() {
        let mut codec = JsonCodec::<Ping>::new();
        let mut buf = BytesMut::from(&br#"{"n":1}{"n":2}  {"n":3}"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 1 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 2 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 3 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_the_rest_of_a_partial_object() {
        let mut codec = JsonCodec::<Ping>::new();
        let mut buf = BytesMut::from(&br#"{"n":"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"42}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 42 }));
    }

    #[test]
    fn garbage_is_an_error() {
        let mut codec = JsonCodec::<Ping>::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 400 Bad Request\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn oversized_partial_frame_is_rejected() {
        let mut codec = JsonCodec::<Ping>::with_max_frame_len(8);
        let mut buf = BytesMut::from(&br#"{"n": 1000000000"#[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { max: 8 })
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        name: String,
        data: String,
    }

    #[test]
    fn large_frame_in_chunks_is_scanned_once() {
        // Quotes, backslashes and brackets inside strings must not end the frame.
        let blob = Blob {
            name: "a}b".to_string(),
            data: "{\"x\": [1, 2]}\\\"] ".repeat(256 * 1024),
        };
        let encoded = serde_json::to_vec(&blob).unwrap();
        assert!(encoded.len() > 4 * 1024 * 1024);

        let mut codec = JsonCodec::<Blob>::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in encoded.chunks(64 * 1024) {
            buf.extend_from_slice(chunk);
            match codec.decode(&mut buf).unwrap() {
                Some(item) => decoded = Some(item),
                None => assert_eq!(codec.scan.scanned, buf.len()),
            }
        }

        assert_eq!(decoded, Some(blob));
        assert!(buf.is_empty());
        assert_eq!(codec.scan, FrameScan::default());
    }

    #[test]
    fn scan_progress_survives_retarget() {
        let mut codec = JsonCodec::<Ping>::new();
        let mut buf = BytesMut::from(&br#"{"n":1}{"name":"x","da"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 1 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        let mut codec = codec.retarget::<Blob>();
        buf.extend_from_slice(br#"ta":"y"}"#);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Blob {
                name: "x".to_string(),
                data: "y".to_string(),
            })
        );
    }

    #[test]
    fn complete_but_invalid_object_is_an_error() {
        let mut codec = JsonCodec::<Ping>::new();
        let mut buf = BytesMut::from(&br#"{"n": }"#[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = JsonCodec::<()>::new();
        let mut buf = BytesMut::new();
        codec.encode(Ping { n: 7 }, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"n\":7}\n");
    }
}
