//! Output cache middleware for axum.
//!
//! Caches GET requests. Mount with
//! `axum::middleware::from_fn_with_state(cache, output_cache_layer)`.

use axum::{
    body::Body,
    extract::State,
    http::{
        Method, Request, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::{
    engine::{CaptureTicket, Lookup, OutputCache},
    request::CacheRequest,
    writer::{BufferedResponse, ResponseWriter, SendArgs},
};

/// Middleware for output caching.
///
/// Hits are served without running the inner service. Misses run it, then
/// complete its response through the capturing writer.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn output_cache_layer(
    State(cache): State<OutputCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Only cache GET requests
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let cache_request = CacheRequest::from_parts(request.uri(), request.headers());

    match cache.lookup(&cache_request).await {
        Lookup::Hit(entry) => {
            let mut writer = BufferedResponse::new();
            cache.replay(&entry, &mut writer).await;
            writer.into_response()
        }
        Lookup::Miss(ticket) => {
            let response = next.run(request).await;
            complete(&cache, Some(ticket), response).await
        }
        Lookup::Forward => {
            let response = next.run(request).await;
            complete(&cache, None, response).await
        }
    }
}

/// Replays the origin's response through the capturing writer.
async fn complete(
    cache: &OutputCache,
    ticket: Option<CaptureTicket>,
    mut response: Response,
) -> Response {
    let max_body_bytes = cache.config().max_body_bytes;

    let Some(ticket) = ticket.filter(|_| is_capturable(&response, max_body_bytes)) else {
        cache.mark_miss(response.headers_mut());
        return response;
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_body(body, max_body_bytes).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Oversized(body)) => {
            debug!(
                cache = "output",
                key = ticket.key(),
                max_body_bytes,
                "origin body exceeds capture limit, streaming through"
            );
            cache.mark_miss(&mut parts.headers);
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            // The origin body is gone, nothing sensible left to forward.
            warn!(error = %err, "failed to buffer origin response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let headers = std::mem::take(&mut parts.headers);
    let mut writer = cache.capture(
        Some(ticket),
        BufferedResponse::with_head(parts.status, headers),
    );

    let status = parts.status.as_u16();
    let location = redirect_location(&parts.status, writer.headers());
    match location {
        Some(location) => writer.redirect(Some(status), &location).await,
        None => writer.send(SendArgs::StatusAndBody(status, bytes)).await,
    }

    writer.into_inner().into_response_with(parts)
}

enum Buffered {
    Complete(Bytes),
    /// Already-read data followed by the rest of the origin stream.
    Oversized(Body),
}

/// Buffer at most `limit` bytes of `body`.
///
/// Once the limit is crossed the body is handed back as a stream, so memory
/// stays bounded by `limit` plus one frame. Trailers are not kept.
async fn buffer_body(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut buffer = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffer.extend_from_slice(&data);

        if buffer.len() > limit {
            let prefix = buffer.freeze();
            let rest = stream::once(async move { Ok::<_, axum::Error>(prefix) })
                .chain(body.into_data_stream());
            return Ok(Buffered::Oversized(Body::from_stream(rest)));
        }
    }

    Ok(Buffered::Complete(buffer.freeze()))
}

/// Event streams and responses declaring an oversized body are forwarded
/// untouched.
fn is_capturable(response: &Response, max_body_bytes: usize) -> bool {
    let headers = response.headers();

    let streaming = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    if streaming {
        return false;
    }

    let declared_len = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    !declared_len.is_some_and(|len| len > max_body_bytes)
}

fn redirect_location(status: &StatusCode, headers: &axum::http::HeaderMap) -> Option<String> {
    if !status.is_redirection() {
        return None;
    }
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
