//! Deferred response builder.
//!
//! Handlers and middlewares describe the response imperatively; nothing is
//! written to the transport until [`Response::emit`] runs, so the media
//! type is selected exactly once before the first byte leaves the core.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::StatusCode;
use portico_codec::TypedValue;
use tokio::io::AsyncReadExt;

use crate::error::ServerError;
use crate::transport::{SendEvent, TransportSender};

/// A streaming body source: chunks are flushed as produced.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ServerError>> + Send>>;

/// Metadata bag merged from node metadata and handler overrides.
pub type Metadata = HashMap<String, serde_json::Value>;

/// File chunks are read and flushed at this granularity.
const FILE_CHUNK: usize = 64 * 1024;

/// Bodies smaller than this are never gzip-compressed.
const COMPRESS_MIN_BYTES: usize = 512;

/// A handler's produced value, before media-type selection.
pub enum Payload {
    /// No value: empty body, `text/plain`.
    None,
    /// A structured value: JSON (typed projection when the request is typed).
    Value(TypedValue),
    /// Literal text: `text/plain`.
    Text(String),
    /// Raw bytes: `application/octet-stream`.
    Bytes(Bytes),
    /// A file on disk: media type guessed from the extension.
    FilePath(PathBuf),
    /// A producer of chunks, flushed with transport backpressure.
    Stream(ByteStream),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::None => f.write_str("Payload::None"),
            Payload::Value(v) => write!(f, "Payload::Value({})", v.kind_name()),
            Payload::Text(_) => f.write_str("Payload::Text"),
            Payload::Bytes(_) => f.write_str("Payload::Bytes"),
            Payload::FilePath(p) => write!(f, "Payload::FilePath({})", p.display()),
            Payload::Stream(_) => f.write_str("Payload::Stream"),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(TypedValue::from_plain(value))
    }
}

impl From<TypedValue> for Payload {
    fn from(value: TypedValue) -> Self {
        Payload::Value(value)
    }
}

enum BodySource {
    Empty,
    Bytes(Bytes),
    File(PathBuf),
    Stream(ByteStream),
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::Empty => f.write_str("Empty"),
            BodySource::Bytes(b) => write!(f, "Bytes({})", b.len()),
            BodySource::File(p) => write!(f, "File({})", p.display()),
            BodySource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Deferred response: status, headers, body source, and merged metadata.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    media_type: Option<String>,
    body: BodySource,
    metadata: Metadata,
    result_set: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Response {
        Response {
            status: StatusCode::OK,
            headers: Vec::new(),
            cookies: Vec::new(),
            media_type: None,
            body: BodySource::Empty,
            metadata: Metadata::new(),
            result_set: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Append a header (multi-valued; e.g. `Set-Cookie`).
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace all values of a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add a `Set-Cookie` directive.
    pub fn add_cookie(&mut self, directive: impl Into<String>) {
        self.cookies.push(directive.into());
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// True once `set_result` ran; used by middlewares to detect
    /// short-circuits further in.
    pub fn has_result(&self) -> bool {
        self.result_set
    }

    /// Record the handler's value and select the media type.
    ///
    /// `metadata` is merged right-biased on top of whatever was already
    /// recorded; an explicit `media_type` entry always wins over the rule
    /// table. `typed` reflects the request's typed mode and upgrades JSON
    /// bodies to the typed projection.
    pub fn set_result(
        &mut self,
        payload: Payload,
        metadata: Metadata,
        typed: bool,
    ) -> Result<(), ServerError> {
        if self.result_set {
            return Err(ServerError::Internal(
                "response result was already set".to_string(),
            ));
        }
        self.result_set = true;
        self.metadata.extend(metadata);

        if let Some(serde_json::Value::Number(status)) = self.metadata.get("status") {
            if let Some(code) = status
                .as_u64()
                .and_then(|s| StatusCode::from_u16(s as u16).ok())
            {
                self.status = code;
            }
        }

        let explicit = self
            .metadata
            .get("media_type")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (body, selected) = match payload {
            Payload::None => (BodySource::Empty, "text/plain".to_string()),
            Payload::Text(text) => (
                BodySource::Bytes(Bytes::from(text)),
                "text/plain".to_string(),
            ),
            Payload::Bytes(bytes) => (
                BodySource::Bytes(bytes),
                "application/octet-stream".to_string(),
            ),
            Payload::FilePath(path) => {
                let guessed = mime_guess::from_path(&path)
                    .first_raw()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                (BodySource::File(path), guessed)
            }
            Payload::Stream(stream) => (
                BodySource::Stream(stream),
                "application/octet-stream".to_string(),
            ),
            Payload::Value(TypedValue::Null) => (BodySource::Empty, "text/plain".to_string()),
            Payload::Value(TypedValue::Str(text)) => (
                BodySource::Bytes(Bytes::from(text)),
                "text/plain".to_string(),
            ),
            Payload::Value(value) => {
                if typed {
                    let text = portico_codec::to_typed_json(&value)?;
                    (
                        BodySource::Bytes(Bytes::from(text)),
                        portico_codec::TYPED_JSON.to_string(),
                    )
                } else {
                    let text = serde_json::to_string(&value.to_plain())
                        .map_err(|e| ServerError::Internal(e.to_string()))?;
                    (
                        BodySource::Bytes(Bytes::from(text)),
                        "application/json".to_string(),
                    )
                }
            }
        };

        self.body = body;
        self.media_type = Some(explicit.unwrap_or(selected));
        Ok(())
    }

    /// Shortcut used by the error path: replace everything with an error
    /// response. Allowed even after `set_result`, because the error path
    /// discards the handler's value.
    pub fn set_error(&mut self, err: &ServerError, debug: bool) {
        self.status = err.http_status();
        self.body = BodySource::Bytes(Bytes::from(err.body(debug).to_string()));
        self.media_type = Some("application/json".to_string());
        self.result_set = true;
    }

    fn final_headers(&self, request_id: Option<&str>, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let Some(mt) = &self.media_type {
            if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-type")) {
                headers.push(("content-type".to_string(), mt.clone()));
            }
        }
        if let Some(secs) = self.metadata.get("cache_seconds").and_then(|v| v.as_u64()) {
            headers.push(("cache-control".to_string(), format!("max-age={secs}")));
        }
        for cookie in &self.cookies {
            headers.push(("set-cookie".to_string(), cookie.clone()));
        }
        if let Some(id) = request_id {
            headers.push(("x-request-id".to_string(), id.to_string()));
        }
        headers.extend(extra.iter().cloned());
        headers
    }

    /// Write the response to the transport: one head frame, then body
    /// frames ending with an empty terminator. Buffered bodies may be
    /// gzip-compressed when the pipeline allowed it; file bodies stream in
    /// chunks with transport backpressure.
    pub async fn emit(
        self,
        sender: &TransportSender,
        request_id: Option<&str>,
        extra_headers: &[(String, String)],
        compress: bool,
    ) -> Result<(), ServerError> {
        let mut headers = self.final_headers(request_id, extra_headers);

        match self.body {
            BodySource::Empty => {
                sender
                    .send(SendEvent::Start {
                        status: self.status,
                        headers,
                    })
                    .await?;
                sender
                    .send(SendEvent::Body {
                        bytes: Bytes::new(),
                        more: false,
                    })
                    .await?;
            }
            BodySource::Bytes(bytes) => {
                let bytes = if compress && bytes.len() >= COMPRESS_MIN_BYTES {
                    let compressed = gzip(&bytes)?;
                    headers.push(("content-encoding".to_string(), "gzip".to_string()));
                    headers.push(("vary".to_string(), "accept-encoding".to_string()));
                    compressed
                } else {
                    bytes
                };
                sender
                    .send(SendEvent::Start {
                        status: self.status,
                        headers,
                    })
                    .await?;
                sender
                    .send(SendEvent::Body { bytes, more: true })
                    .await?;
                sender
                    .send(SendEvent::Body {
                        bytes: Bytes::new(),
                        more: false,
                    })
                    .await?;
            }
            BodySource::File(path) => {
                let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                    ServerError::NotFound(format!("resource {}: {e}", path.display()))
                })?;
                sender
                    .send(SendEvent::Start {
                        status: self.status,
                        headers,
                    })
                    .await?;
                let mut buf = vec![0u8; FILE_CHUNK];
                loop {
                    let n = file
                        .read(&mut buf)
                        .await
                        .map_err(|e| ServerError::Internal(format!("file read: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    sender
                        .send(SendEvent::Body {
                            bytes: Bytes::copy_from_slice(&buf[..n]),
                            more: true,
                        })
                        .await?;
                }
                sender
                    .send(SendEvent::Body {
                        bytes: Bytes::new(),
                        more: false,
                    })
                    .await?;
            }
            BodySource::Stream(mut stream) => {
                sender
                    .send(SendEvent::Start {
                        status: self.status,
                        headers,
                    })
                    .await?;
                while let Some(chunk) = stream.next().await {
                    sender
                        .send(SendEvent::Body {
                            bytes: chunk?,
                            more: true,
                        })
                        .await?;
                }
                sender
                    .send(SendEvent::Body {
                        bytes: Bytes::new(),
                        more: false,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

fn gzip(bytes: &[u8]) -> Result<Bytes, ServerError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| ServerError::Internal(format!("gzip: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    fn drain(mut rx: tokio::sync::mpsc::Receiver<SendEvent>) -> Vec<SendEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn media_type_rule_table() {
        let mut r = Response::new();
        r.set_result(
            Payload::Value(TypedValue::Object(vec![])),
            Metadata::new(),
            false,
        )
        .unwrap();
        assert_eq!(r.media_type.as_deref(), Some("application/json"));

        let mut r = Response::new();
        r.set_result(Payload::Text("hi".into()), Metadata::new(), false)
            .unwrap();
        assert_eq!(r.media_type.as_deref(), Some("text/plain"));

        let mut r = Response::new();
        r.set_result(Payload::Bytes(Bytes::from_static(b"x")), Metadata::new(), false)
            .unwrap();
        assert_eq!(r.media_type.as_deref(), Some("application/octet-stream"));

        let mut r = Response::new();
        r.set_result(Payload::FilePath("logo.png".into()), Metadata::new(), false)
            .unwrap();
        assert_eq!(r.media_type.as_deref(), Some("image/png"));

        let mut r = Response::new();
        r.set_result(Payload::None, Metadata::new(), false).unwrap();
        assert_eq!(r.media_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn explicit_media_type_wins() {
        let mut meta = Metadata::new();
        meta.insert("media_type".into(), serde_json::json!("application/xml"));
        let mut r = Response::new();
        r.set_result(Payload::Text("<x/>".into()), meta, false).unwrap();
        assert_eq!(r.media_type.as_deref(), Some("application/xml"));
    }

    #[test]
    fn typed_requests_get_typed_json() {
        let mut r = Response::new();
        r.set_result(
            Payload::Value(TypedValue::Object(vec![(
                "price".into(),
                TypedValue::Decimal("1.50".parse().unwrap()),
            )])),
            Metadata::new(),
            true,
        )
        .unwrap();
        assert_eq!(r.media_type.as_deref(), Some(portico_codec::TYPED_JSON));
    }

    #[test]
    fn second_set_result_is_an_error() {
        let mut r = Response::new();
        r.set_result(Payload::None, Metadata::new(), false).unwrap();
        assert!(r.set_result(Payload::None, Metadata::new(), false).is_err());
    }

    #[tokio::test]
    async fn emit_writes_head_then_body_then_terminator() {
        let (_in_rx, _in_tx, sender, out_rx) = channel_pair(4);
        let mut r = Response::new();
        r.set_result(
            Payload::Value(TypedValue::Object(vec![])),
            Metadata::new(),
            false,
        )
        .unwrap();
        r.emit(&sender, Some("req-1"), &[], false).await.unwrap();

        let events = drain(out_rx);
        assert_eq!(events.len(), 3);
        match &events[0] {
            SendEvent::Start { status, headers } => {
                assert_eq!(*status, StatusCode::OK);
                assert!(headers
                    .iter()
                    .any(|(n, v)| n == "x-request-id" && v == "req-1"));
            }
            other => panic!("expected Start, got {other:?}"),
        }
        assert!(matches!(events[1], SendEvent::Body { more: true, .. }));
        assert!(matches!(events[2], SendEvent::Body { more: false, .. }));
    }
}
