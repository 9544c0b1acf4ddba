//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them for transmission over TCP. Bodies are either fully
//! buffered or streamed from an [`AsyncRead`] source with chunked framing.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{Headers, StatusCode};

/// Size of each chunk read from a streamed body.
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// A boxed byte source for streamed response bodies.
pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

/// The payload of a [`Response`].
pub enum Body {
    /// A fully buffered body, framed with `Content-Length`.
    Full(Bytes),
    /// A body drained from a reader while the response is written, framed with
    /// `Transfer-Encoding: chunked`.
    Stream(BodyStream),
}

impl Body {
    /// Returns the buffered bytes, or `None` for streamed bodies.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    /// Returns `true` if the body is streamed.
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Reads the whole body into memory, draining a stream to its end.
    ///
    /// # Errors
    ///
    /// Returns the first read error from a streamed body.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Bytes::new())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
            keep_alive: true,
        }
    }

    /// Builds a `200 OK` response that streams the file at `path`.
    ///
    /// The `Content-Type` is guessed from the file extension, falling back to
    /// `application/octet-stream`. The file is read while the response is
    /// written, never buffered whole.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened.
    pub async fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::file_stream(file, path))
    }

    /// Streams an already open `file`, typed by the extension of `path`.
    pub fn file_stream(file: tokio::fs::File, path: &Path) -> Self {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        Self::new(StatusCode::Ok)
            .content_type(mime.essence_str())
            .stream(file)
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Replaces any existing `Content-Type` header.
    #[must_use]
    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.headers.set("Content-Type", value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Streams the response body from `reader` when the response is written.
    #[must_use]
    pub fn stream(mut self, reader: impl AsyncRead + Send + 'static) -> Self {
        self.body = Body::Stream(Box::pin(reader));
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns `true` if the connection should stay open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    // Status line plus headers, terminated by the blank separator line.
    fn head(&mut self, content_length: Option<usize>) -> BytesMut {
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Framing is always the last header before the blank line
        match content_length {
            Some(len) => buf.put(format!("Content-Length: {len}\r\n").as_bytes()),
            None => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
        }

        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` for buffered bodies.
    /// - `Connection: keep-alive` or `Connection: close`.
    ///
    /// Streamed bodies are not drained here: the head announces chunked framing
    /// and is followed by the terminating empty chunk. Use
    /// [`write_to`](Self::write_to) to send a streamed body.
    pub fn into_bytes(mut self) -> BytesMut {
        match std::mem::take(&mut self.body) {
            Body::Full(body) => {
                if !body.is_empty() && !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                let mut buf = self.head(Some(body.len()));
                buf.put(body);
                buf
            }
            Body::Stream(_) => {
                let mut buf = self.head(None);
                buf.put(&b"0\r\n\r\n"[..]);
                buf
            }
        }
    }

    /// Writes the response to `out`, draining a streamed body chunk by chunk.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error from either side. When the body stream
    /// fails mid-way the chunked body is left unterminated so the peer sees a
    /// truncated response; the caller is expected to close the connection.
    pub async fn write_to<W>(mut self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reader = match std::mem::take(&mut self.body) {
            Body::Stream(reader) => reader,
            full => {
                self.body = full;
                out.write_all(&self.into_bytes()).await?;
                return out.flush().await;
            }
        };

        if !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", "application/octet-stream");
        }
        out.write_all(&self.head(None)).await?;

        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "response body stream failed: truncating response");
                    out.flush().await?;
                    return Err(e);
                }
            };
            out.write_all(format!("{n:x}\r\n").as_bytes()).await?;
            out.write_all(&chunk[..n]).await?;
            out.write_all(b"\r\n").await?;
        }

        out.write_all(b"0\r\n\r\n").await?;
        out.flush().await
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
