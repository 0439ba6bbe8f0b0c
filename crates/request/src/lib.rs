//! Streaming HTTP request layer: issues the SPF request and splits a
//! chunked, multipart body into individual JSON [`Response`] parts as bytes
//! arrive.
//!
//! Grounded on the teacher's transport control-loop idiom (an event channel
//! drained by the caller, a spawned task owning the actual I/O, and
//! `tokio::select!` racing the work against a timeout) rather than its
//! exact CDP wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use spf_core_types::{Response, SpfError};

/// One event emitted while a request is in flight, in the order the spec's
/// publish sequence expects: `Headers`, zero or more `Part`, then exactly
/// one of `Success`/`Error`/`Timeout`.
#[derive(Debug)]
pub enum RequestEvent {
    Headers { status: u16 },
    Part(Response),
    Success,
    Error(SpfError),
    Timeout,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
}

pub struct RequestSpec {
    pub url: String,
    pub method: Method,
    pub post_data: Option<Bytes>,
    pub timeout_ms: u64,
    /// Literal sentinel separating parts in a multipart body. Configurable
    /// since the exact token is a server implementation detail.
    pub delimiter: String,
}

/// The HTTP collaborator seam. A real implementation streams from the
/// network; a fake can replay canned bytes for tests without sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues `spec` and emits events on `tx` until the terminal event.
    /// Implementations must always send exactly one terminal event
    /// (`Success`, `Error`, or `Timeout`), even on internal failure.
    async fn request(&self, spec: RequestSpec, tx: mpsc::Sender<RequestEvent>);
}

/// Accumulates streamed text and emits one parsed [`Response`] per complete,
/// delimiter-separated JSON object, tolerating the delimiter (or a JSON
/// object) straddling chunk boundaries. A malformed segment, a malformed
/// trailing body, or a body that doesn't open on `{` is a parse error: the
/// caller aborts the navigation rather than silently dropping it.
pub struct PartSplitter {
    delimiter: String,
    buffer: String,
    /// Whether the opening-framing check has already passed once. Checked
    /// only on the first non-empty buffer contents seen.
    framing_checked: bool,
}

impl PartSplitter {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buffer: String::new(),
            framing_checked: false,
        }
    }

    /// Feeds a chunk of streamed text, returning every complete part it
    /// newly completes. Incomplete trailing text is retained for the next
    /// call (or for `flush`).
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Response>, SpfError> {
        self.buffer.push_str(chunk);
        self.check_framing()?;
        self.drain_complete()
    }

    /// Parses whatever remains in the buffer as a final, undelimited part
    /// (single-response bodies never carry a trailing delimiter).
    pub fn flush(&mut self) -> Result<Vec<Response>, SpfError> {
        let mut parts = self.drain_complete()?;
        let remainder = std::mem::take(&mut self.buffer);
        let trimmed = remainder.trim();
        if !trimmed.is_empty() {
            let part = serde_json::from_str::<Response>(trimmed)
                .map_err(|err| SpfError::parse(format!("trailing body was not a valid JSON part: {err}")))?;
            parts.push(part);
        }
        Ok(parts)
    }

    /// Rejects a body that does not open on `{`, once enough of it has
    /// arrived to judge. Checked only once per stream.
    fn check_framing(&mut self) -> Result<(), SpfError> {
        if self.framing_checked {
            return Ok(());
        }
        let trimmed = self.buffer.trim_start();
        if trimmed.is_empty() {
            return Ok(());
        }
        if !trimmed.starts_with('{') {
            return Err(SpfError::parse("response body did not open with the expected '{' framing character"));
        }
        self.framing_checked = true;
        Ok(())
    }

    fn drain_complete(&mut self) -> Result<Vec<Response>, SpfError> {
        let mut parts = Vec::new();
        if self.delimiter.is_empty() {
            return Ok(parts);
        }
        while let Some(idx) = self.buffer.find(self.delimiter.as_str()) {
            let piece: String = self.buffer.drain(..idx).collect();
            self.buffer.drain(..self.delimiter.len());
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            let part = serde_json::from_str::<Response>(trimmed)
                .map_err(|err| SpfError::parse(format!("malformed multipart segment: {err}")))?;
            parts.push(part);
        }
        Ok(parts)
    }
}

fn is_success_status(status: u16) -> bool {
    (200..=206).contains(&status) || status == 304
}

/// Default [`Transport`]: a real `reqwest` client, streaming the body and
/// racing it against `spec.timeout_ms`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, spec: RequestSpec, tx: mpsc::Sender<RequestEvent>) {
        let work = self.drive(spec.url.clone(), spec.method, spec.post_data.clone(), spec.delimiter, tx.clone());
        if spec.timeout_ms == 0 {
            work.await;
            return;
        }
        let timeout = Duration::from_millis(spec.timeout_ms);
        if tokio::time::timeout(timeout, work).await.is_err() {
            let _ = tx.send(RequestEvent::Timeout).await;
        }
    }
}

impl ReqwestTransport {
    async fn drive(
        &self,
        url: String,
        method: Method,
        post_data: Option<Bytes>,
        delimiter: String,
        tx: mpsc::Sender<RequestEvent>,
    ) {
        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(body) = post_data {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let _ = tx
                    .send(RequestEvent::Error(SpfError::transport(err.to_string()).retriable(true)))
                    .await;
                return;
            }
        };

        let status = response.status().as_u16();
        if tx.send(RequestEvent::Headers { status }).await.is_err() {
            return;
        }
        if !is_success_status(status) {
            let _ = tx
                .send(RequestEvent::Error(SpfError::transport(format!("status {status}"))))
                .await;
            return;
        }

        let mut splitter = PartSplitter::new(delimiter);
        let mut stream = response.bytes_stream();
        while let Some(next) = stream.next().await {
            match next {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    match splitter.feed(&text) {
                        Ok(parts) => {
                            for part in parts {
                                if tx.send(RequestEvent::Part(part)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(RequestEvent::Error(err)).await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(RequestEvent::Error(SpfError::transport(err.to_string()))).await;
                    return;
                }
            }
        }
        match splitter.flush() {
            Ok(parts) => {
                for part in parts {
                    if tx.send(RequestEvent::Part(part)).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(RequestEvent::Error(err)).await;
                return;
            }
        }
        let _ = tx.send(RequestEvent::Success).await;
    }
}
