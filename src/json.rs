//! Newline-delimited JSON codec for async byte streams.
//!
//! One JSON object per line, `\n`-terminated:
//!
//! ```text
//! {"request_id":1,"type":"Clock","id":"","request":"Now","params":{...}}
//! {"request_id":1,"response":{...}}
//! {"request_id":2,"error":"boom","error_code":"code"}
//! ```
//!
//! Absent fields are omitted. A line that does not parse as a frame is a
//! transport error and kills the connection; a `params`/`response` value of
//! the wrong shape is a per-request decode error and does not.
//!
//! Works over any `AsyncRead + AsyncWrite + Unpin` byte stream: TCP or Unix
//! sockets, or an in-memory duplex pipe in tests.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::Codec;
use crate::wire::Header;

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// Owned frame shape for the read side.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FrameIn {
    request_id: u64,
    #[serde(rename = "type")]
    object_type: String,
    #[serde(rename = "id")]
    object_id: String,
    request: String,
    params: Option<Value>,
    response: Option<Value>,
    error: String,
    error_code: String,
}

/// Borrowed frame shape for the write side, so bodies are not cloned.
#[derive(Serialize)]
struct FrameOut<'a> {
    request_id: u64,
    #[serde(rename = "type", skip_serializing_if = "str::is_empty")]
    object_type: &'a str,
    #[serde(rename = "id", skip_serializing_if = "str::is_empty")]
    object_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    request: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a Value>,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    error_code: &'a str,
}

/// A JSON-lines codec over an async byte stream.
pub struct JsonCodec<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
    /// Body of the most recently read header, pending a `read_body` call.
    pending_body: Option<Value>,
    /// Reused between writes to avoid reallocations.
    encode_buf: Vec<u8>,
    closed: bool,
}

impl<S> JsonCodec<S> {
    /// Wrap an async byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            pending_body: None,
            encode_buf: Vec::with_capacity(256),
            closed: false,
        }
    }

    /// Consume the codec and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Extract the next complete line from the buffer, if one is present.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let start = self.unread_start;
        let rel = self.buf[start..].iter().position(|b| *b == b'\n')?;
        let line = self.buf[start..start + rel].to_vec();
        self.unread_start = start + rel + 1;
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
        } else if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
        Some(line)
    }
}

impl<S> JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Read one frame. Cancel-safe: partial lines stay buffered.
    async fn recv_frame(&mut self) -> io::Result<Option<FrameIn>> {
        loop {
            if let Some(line) = self.take_line() {
                let frame: FrameIn = serde_json::from_slice(&line).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad frame: {e}"))
                })?;
                trace!(frame = %String::from_utf8_lossy(&line), "<-");
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof inside a frame ({trailing} buffered bytes)"),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

impl<S> Codec for JsonCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_header(&mut self) -> io::Result<Option<Header>> {
        let Some(frame) = self.recv_frame().await? else {
            return Ok(None);
        };
        let FrameIn {
            request_id,
            object_type,
            object_id,
            request,
            params,
            response,
            error,
            error_code,
        } = frame;
        let body = if request.is_empty() { response } else { params };
        self.pending_body = match body {
            None | Some(Value::Null) => None,
            some => some,
        };
        Ok(Some(Header {
            request_id,
            object_type,
            object_id,
            request,
            error,
            error_code,
        }))
    }

    async fn read_body(&mut self, _is_request: bool) -> io::Result<Option<Value>> {
        Ok(self.pending_body.take())
    }

    async fn write_message(&mut self, header: &Header, body: Option<&Value>) -> io::Result<()> {
        let is_request = header.is_request();
        let frame = FrameOut {
            request_id: header.request_id,
            object_type: &header.object_type,
            object_id: &header.object_id,
            request: &header.request,
            params: if is_request { body } else { None },
            response: if is_request { None } else { body },
            error: &header.error,
            error_code: &header.error_code,
        };
        self.encode_buf.clear();
        serde_json::to_writer(&mut self.encode_buf, &frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        trace!(frame = %String::from_utf8_lossy(&self.encode_buf), "->");
        self.encode_buf.push(b'\n');
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn request_header(id: u64) -> Header {
        Header {
            request_id: id,
            object_type: "Frobber".into(),
            object_id: "a1".into(),
            request: "Frob".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (left, right) = duplex(4096);
        let mut tx = JsonCodec::new(left);
        let mut rx = JsonCodec::new(right);

        let body = serde_json::json!({"x": "param"});
        tx.write_message(&request_header(1), Some(&body)).await.unwrap();

        let hdr = rx.read_header().await.unwrap().expect("expected header");
        assert_eq!(hdr, request_header(1));
        assert!(hdr.is_request());
        assert_eq!(rx.read_body(true).await.unwrap(), Some(body));
    }

    #[tokio::test]
    async fn success_response_roundtrip() {
        let (left, right) = duplex(4096);
        let mut tx = JsonCodec::new(left);
        let mut rx = JsonCodec::new(right);

        let hdr = Header {
            request_id: 3,
            ..Default::default()
        };
        let body = serde_json::json!({"x": "result"});
        tx.write_message(&hdr, Some(&body)).await.unwrap();

        let got = rx.read_header().await.unwrap().expect("expected header");
        assert_eq!(got, hdr);
        assert!(!got.is_request());
        assert_eq!(rx.read_body(false).await.unwrap(), Some(body));
    }

    #[tokio::test]
    async fn error_response_roundtrip() {
        let (left, right) = duplex(4096);
        let mut tx = JsonCodec::new(left);
        let mut rx = JsonCodec::new(right);

        let hdr = Header {
            request_id: 2,
            error: "an error".into(),
            error_code: "a code".into(),
            ..Default::default()
        };
        tx.write_message(&hdr, None).await.unwrap();

        let got = rx.read_header().await.unwrap().expect("expected header");
        assert_eq!(got, hdr);
        assert_eq!(rx.read_body(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_body_reads_as_absent() {
        let (mut raw, right) = duplex(4096);
        raw.write_all(b"{\"request_id\":7,\"request\":\"Ping\",\"params\":null}\n")
            .await
            .unwrap();

        let mut rx = JsonCodec::new(right);
        let hdr = rx.read_header().await.unwrap().expect("expected header");
        assert_eq!(hdr.request, "Ping");
        assert_eq!(rx.read_body(true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn split_writes_reassemble() {
        let (mut raw, right) = duplex(4096);
        let mut rx = JsonCodec::new(right);

        raw.write_all(b"{\"request_id\":1,").await.unwrap();
        // Nothing complete yet; feed the rest and a second frame in one burst.
        raw.write_all(b"\"request\":\"Go\"}\n{\"request_id\":2,\"request\":\"Go\"}\n")
            .await
            .unwrap();

        let first = rx.read_header().await.unwrap().expect("first frame");
        assert_eq!(first.request_id, 1);
        rx.read_body(true).await.unwrap();
        let second = rx.read_header().await.unwrap().expect("second frame");
        assert_eq!(second.request_id, 2);
    }

    #[tokio::test]
    async fn bad_frame_is_invalid_data() {
        let (mut raw, right) = duplex(4096);
        raw.write_all(b"not json\n").await.unwrap();

        let mut rx = JsonCodec::new(right);
        let err = rx.read_header().await.expect_err("expected invalid data");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_inside_frame_is_unexpected_eof() {
        let (mut raw, right) = duplex(4096);
        raw.write_all(b"{\"request_id\":1").await.unwrap();
        raw.shutdown().await.unwrap();

        let mut rx = JsonCodec::new(right);
        let err = rx.read_header().await.expect_err("expected eof error");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn clean_eof_reads_as_end_of_stream() {
        let (mut raw, right) = duplex(4096);
        raw.write_all(b"{\"request_id\":1,\"request\":\"Go\"}\n")
            .await
            .unwrap();
        raw.shutdown().await.unwrap();

        let mut rx = JsonCodec::new(right);
        assert!(rx.read_header().await.unwrap().is_some());
        rx.read_body(true).await.unwrap();
        assert!(rx.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (left, _right) = duplex(64);
        let mut codec = JsonCodec::new(left);
        codec.close().await.unwrap();
        codec.close().await.unwrap();
    }
}
