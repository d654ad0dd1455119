//! Response-writing capability and the capturing decorator.
//!
//! The origin completes a response through a [`ResponseWriter`]. On a miss
//! the engine hands the origin a [`CapturingWriter`] instead, which snapshots
//! the completion, persists it and then forwards the completion to the
//! wrapped writer exactly once.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
        response::Parts,
    },
    response::Response,
};
use bytes::Bytes;
use tracing::warn;

use super::{
    engine::{CaptureTicket, Completion, OutputCache},
    skip::CACHE_STATUS_HEADER,
};

const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Status of a redirect completion; missing or zero means 302.
fn redirect_status(status: Option<u16>) -> u16 {
    status
        .filter(|status| *status != 0)
        .unwrap_or(DEFAULT_REDIRECT_STATUS)
}

/// Arguments of a body-sending completion.
///
/// Mirrors the loose calling convention of "send": either a status and a
/// body, a bare status, or a bare body that keeps the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendArgs {
    StatusAndBody(u16, Bytes),
    Status(u16),
    Body(Bytes),
}

impl SendArgs {
    /// Final status and body given the status already set on the response.
    pub fn resolve(self, current_status: u16) -> (u16, Bytes) {
        match self {
            Self::StatusAndBody(status, body) => (status, body),
            Self::Status(status) => (status, Bytes::new()),
            Self::Body(body) => (current_status, body),
        }
    }
}

/// Something that can write a final HTTP response.
#[async_trait]
pub trait ResponseWriter: Send {
    fn status(&self) -> u16;

    fn set_status(&mut self, status: u16);

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Complete the response with a body.
    async fn send(&mut self, args: SendArgs);

    /// Complete the response with a JSON body, keeping the current status.
    async fn send_json(&mut self, value: serde_json::Value) {
        if !self.headers().contains_key(CONTENT_TYPE) {
            self.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        self.send(SendArgs::Body(Bytes::from(value.to_string())))
            .await;
    }

    /// Complete the response as a redirect. `None` or `Some(0)` means 302.
    async fn redirect(&mut self, status: Option<u16>, location: &str);
}

/// Copy response headers into an ordered, owned snapshot.
///
/// Values are kept byte for byte. The cache-status indicator is left out.
pub fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, Bytes)> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str() != CACHE_STATUS_HEADER)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect()
}

/// Replace `headers` with a stored snapshot.
pub fn restore_headers(headers: &mut HeaderMap, snapshot: &[(String, Bytes)]) {
    headers.clear();
    for (name, value) in snapshot {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_maybe_shared(value.clone()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
}

/// In-memory writer that materializes an axum [`Response`].
#[derive(Debug)]
pub struct BufferedResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    completed: bool,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::with_head(StatusCode::OK, HeaderMap::new())
    }

    /// Start from a status and headers already produced upstream.
    pub fn with_head(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status: status.as_u16(),
            headers,
            body: Bytes::new(),
            completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_response(self) -> Response {
        let (parts, _) = Response::new(Body::empty()).into_parts();
        self.into_response_with(parts)
    }

    /// Build the response on top of existing parts, keeping their version
    /// and extensions.
    ///
    /// `content-length` is recomputed from the final body.
    pub fn into_response_with(mut self, mut parts: Parts) -> Response {
        parts.status = StatusCode::from_u16(self.status).unwrap_or_else(|_| {
            warn!(status = self.status, "invalid response status, sending 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        self.headers.remove(CONTENT_LENGTH);
        parts.headers = self.headers;
        Response::from_parts(parts, Body::from(self.body))
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn send(&mut self, args: SendArgs) {
        let (status, body) = args.resolve(self.status);
        self.status = status;
        self.body = body;
        self.completed = true;
    }

    async fn redirect(&mut self, status: Option<u16>, location: &str) {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                self.headers.insert(LOCATION, value);
            }
            Err(err) => warn!(location, error = %err, "dropping invalid redirect location"),
        }
        self.status = redirect_status(status);
        self.body = Bytes::new();
        self.completed = true;
    }
}

/// Decorator installed in front of the origin's writer.
///
/// With a ticket it captures the completion into the cache; without one it
/// only marks the response as a miss. Either way the wrapped writer is
/// completed at most once.
pub struct CapturingWriter<W> {
    cache: OutputCache,
    ticket: Option<CaptureTicket>,
    inner: W,
    completed: bool,
}

impl<W: ResponseWriter> CapturingWriter<W> {
    pub(crate) fn new(cache: OutputCache, ticket: Option<CaptureTicket>, inner: W) -> Self {
        Self {
            cache,
            ticket,
            inner,
            completed: false,
        }
    }

    /// Returns true once the origin completed the response.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_capturing(&self) -> bool {
        self.ticket.is_some()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Claims the single completion. Returns false for repeated calls.
    fn begin_completion(&mut self, op: &'static str) -> bool {
        if self.completed {
            warn!(op, "response already completed, ignoring repeated completion");
            return false;
        }
        self.completed = true;
        true
    }

    async fn persist(&mut self, completion: Completion) {
        if let Some(ticket) = self.ticket.take() {
            let headers = snapshot_headers(self.inner.headers());
            self.cache.persist(ticket, headers, completion).await;
        }
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for CapturingWriter<W> {
    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn set_status(&mut self, status: u16) {
        self.inner.set_status(status);
    }

    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn send(&mut self, args: SendArgs) {
        if !self.begin_completion("send") {
            return;
        }

        let (status, body) = args.clone().resolve(self.inner.status());
        self.persist(Completion::Body { status, body }).await;

        self.cache.mark_miss(self.inner.headers_mut());
        self.inner.send(args).await;
    }

    async fn redirect(&mut self, status: Option<u16>, location: &str) {
        if !self.begin_completion("redirect") {
            return;
        }

        let completion = Completion::Redirect {
            status: redirect_status(status),
            target: location.to_string(),
        };
        self.persist(completion).await;

        self.cache.mark_miss(self.inner.headers_mut());
        self.inner.redirect(status, location).await;
    }
}
