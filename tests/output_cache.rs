use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    http::{
        HeaderValue, Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, LOCATION},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use outcache::cache::{
    CACHE_STATUS_HEADER, CacheConfig, CacheEntry, CacheEvent, CacheProvider, CacheRequest,
    OutputCache, ProviderError, ProviderOp, Ttl, VaryByQuery, output_cache_layer,
};
use tower::ServiceExt;

fn counted_app(cache: OutputCache, calls: Arc<AtomicUsize>) -> Router {
    let json_calls = Arc::clone(&calls);
    let redirect_calls = Arc::clone(&calls);
    let missing_calls = Arc::clone(&calls);
    let fresh_calls = Arc::clone(&calls);
    let private_calls = Arc::clone(&calls);
    let echo_calls = calls;

    Router::new()
        .route(
            "/",
            get(move || {
                let calls = Arc::clone(&json_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"hello": "world"}))
                }
            }),
        )
        .route(
            "/redirect",
            get(move || {
                let calls = Arc::clone(&redirect_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::MOVED_PERMANENTLY, [(LOCATION, "/target")])
                }
            }),
        )
        .route(
            "/missing",
            get(move || {
                let calls = Arc::clone(&missing_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::NOT_FOUND, "not here")
                }
            }),
        )
        .route(
            "/fresh",
            get(move || {
                let calls = Arc::clone(&fresh_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (
                        [
                            (CACHE_CONTROL, "public, max-age=30, stale-while-revalidate=5"),
                            (CONTENT_TYPE, "text/html; charset=utf-8"),
                        ],
                        [("x-custom", "1")],
                        "<html></html>",
                    )
                }
            }),
        )
        .route(
            "/private",
            get(move || {
                let calls = Arc::clone(&private_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(CACHE_CONTROL, "no-store")], "secret")
                }
            }),
        )
        .route(
            "/echo",
            get(move |request: Request<Body>| {
                let calls = Arc::clone(&echo_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    format!("{}#{n}", request.uri())
                }
            })
            .post(|| async { "posted" }),
        )
        .layer(middleware::from_fn_with_state(cache, output_cache_layer))
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn body_string(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn indicator(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn json_response_is_replayed_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    let first = send(&app, get_request("/")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(indicator(&first), Some("ms"));
    let first_body = body_string(first).await;

    let second = send(&app, get_request("/")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(indicator(&second), Some("ht 600 0"));
    assert_eq!(second.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(second.headers()[CACHE_CONTROL], "max-age=600");
    assert_eq!(body_string(second).await, first_body);

    assert_eq!(first_body, r#"{"hello":"world"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redirect_is_replayed_with_status_and_location() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    let first = send(&app, get_request("/redirect")).await;
    assert_eq!(first.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(indicator(&first), Some("ms"));

    let second = send(&app, get_request("/redirect")).await;
    assert_eq!(second.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(second.headers()[LOCATION], "/target");
    assert_eq!(indicator(&second), Some("ht 600 0"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn skip_flag_in_query_always_reaches_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, get_request("/?cache=false")).await;
        assert_eq!(indicator(&response), Some("ms"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn skip_header_and_cookie_always_reach_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    // Warm the entry, then bypass it.
    send(&app, get_request("/")).await;

    let mut by_header = get_request("/");
    by_header
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("ms"));
    assert_eq!(indicator(&send(&app, by_header).await), Some("ms"));

    let mut by_cookie = get_request("/");
    by_cookie
        .headers_mut()
        .insert(COOKIE, HeaderValue::from_static("x-output-cache=ms"));
    assert_eq!(indicator(&send(&app, by_cookie).await), Some("ms"));

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn skip_flags_are_ignored_when_disallowed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        allow_skip: false,
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    send(&app, get_request("/?cache=false")).await;
    let second = send(&app, get_request("/?cache=false")).await;

    assert_eq!(indicator(&second), Some("ht 600 0"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_errors_are_skipped_when_configured() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        skip_4xx: true,
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, get_request("/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(indicator(&response), Some("ms"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_errors_are_cached_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    send(&app, get_request("/missing")).await;
    let second = send(&app, get_request("/missing")).await;

    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(indicator(&second), Some("ht 600 0"));
    assert_eq!(body_string(second).await, "not here");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn origin_cache_control_sets_ttl_and_headers_round_trip() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    send(&app, get_request("/fresh")).await;
    let second = send(&app, get_request("/fresh")).await;

    assert_eq!(indicator(&second), Some("ht 30 5"));
    assert_eq!(second.headers()["x-custom"], "1");
    assert_eq!(second.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(
        second.headers()[CACHE_CONTROL],
        "public, max-age=30, stale-while-revalidate=5"
    );
    assert_eq!(body_string(second).await, "<html></html>");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn origin_ttl_is_ignored_without_cache_header_support() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        use_cache_header: false,
        ttl: 120,
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    send(&app, get_request("/private")).await;
    let second = send(&app, get_request("/private")).await;

    assert_eq!(indicator(&second), Some("ht 120 0"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_store_responses_are_not_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    send(&app, get_request("/private")).await;
    let second = send(&app, get_request("/private")).await;

    assert_eq!(indicator(&second), Some("ms"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn whole_query_varies_the_key_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    let a = body_string(send(&app, get_request("/echo?page=1")).await).await;
    let b = body_string(send(&app, get_request("/echo?page=2")).await).await;
    let a_again = body_string(send(&app, get_request("/echo?page=1")).await).await;

    assert_ne!(a, b);
    assert_eq!(a, a_again);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn listed_query_params_vary_the_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        vary_by_query: VaryByQuery::names(["page"]),
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    send(&app, get_request("/echo?page=1&utm=a")).await;
    let same_page = send(&app, get_request("/echo?page=1&utm=b")).await;
    assert_eq!(indicator(&same_page), Some("ht 600 0"));

    let other_page = send(&app, get_request("/echo?page=2&utm=a")).await;
    assert_eq!(indicator(&other_page), Some("ms"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_query_variation_shares_one_entry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        vary_by_query: VaryByQuery::Disabled,
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    send(&app, get_request("/echo?page=1")).await;
    let second = send(&app, get_request("/echo?page=2")).await;

    assert_eq!(indicator(&second), Some("ht 600 0"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listed_cookies_vary_the_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        vary_by_cookies: vec!["locale".to_string()],
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    let with_locale = |locale: &'static str| {
        let mut request = get_request("/echo");
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_static(locale));
        request
    };

    send(&app, with_locale("locale=en; session=1")).await;
    let same = send(&app, with_locale("session=2; locale=en")).await;
    assert_eq!(indicator(&same), Some("ht 600 0"));

    let other = send(&app, with_locale("locale=fr")).await;
    assert_eq!(indicator(&other), Some("ms"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn path_case_is_folded_unless_case_sensitive() {
    let cache = OutputCache::new(CacheConfig::default());
    let sensitive = OutputCache::new(CacheConfig {
        case_sensitive: true,
        ..Default::default()
    });
    let request = CacheRequest::new("/Echo").with_query(Some("Page=1"));

    assert_eq!(cache.cache_key(&request), "p-/echo-q-Page%3D1");
    assert_eq!(sensitive.cache_key(&request), "p-/Echo-q-Page%3D1");
}

#[tokio::test]
async fn indicator_is_omitted_when_headers_are_disabled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        no_headers: true,
        ..Default::default()
    };
    let app = counted_app(OutputCache::new(config), Arc::clone(&calls));

    let first = send(&app, get_request("/")).await;
    let second = send(&app, get_request("/")).await;

    assert_eq!(indicator(&first), None);
    assert_eq!(indicator(&second), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_get_requests_pass_through() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .body(Body::empty())
        .expect("request should build");
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(indicator(&response), None);
    assert_eq!(body_string(response).await, "posted");
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_max_age_and_stale_window() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    send(&app, get_request("/fresh")).await;

    tokio::time::advance(Duration::from_secs(34)).await;
    assert_eq!(
        indicator(&send(&app, get_request("/fresh")).await),
        Some("ht 30 5")
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(indicator(&send(&app, get_request("/fresh")).await), Some("ms"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn instances_do_not_share_storage() {
    let calls = Arc::new(AtomicUsize::new(0));
    let first = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));
    let second = counted_app(OutputCache::new(CacheConfig::default()), Arc::clone(&calls));

    send(&first, get_request("/")).await;
    let response = send(&second, get_request("/")).await;

    assert_eq!(indicator(&response), Some("ms"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct FailingProvider {
    fail_get: bool,
}

#[async_trait]
impl CacheProvider for FailingProvider {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, ProviderError> {
        if self.fail_get {
            Err(ProviderError::unavailable("connection refused"))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, _key: &str, _entry: CacheEntry, _ttl: Ttl) -> Result<(), ProviderError> {
        Err(ProviderError::backend("write rejected"))
    }
}

#[tokio::test]
async fn failing_get_is_reported_and_origin_still_serves() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = OutputCache::builder(CacheConfig::default())
        .provider(Arc::new(FailingProvider { fail_get: true }))
        .build();
    let mut events = cache.subscribe();
    let app = counted_app(cache, Arc::clone(&calls));

    let response = send(&app, get_request("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(indicator(&response), Some("ms"));
    assert_eq!(body_string(response).await, r#"{"hello":"world"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CacheEvent::ProviderError { operation, error } = &event {
            assert_eq!(*operation, ProviderOp::Get);
            assert!(error.to_string().contains("connection refused"));
        }
        names.push(event.name());
    }
    assert_eq!(names, vec!["miss", "cacheProviderError"]);
}

#[tokio::test]
async fn failing_set_is_reported_and_response_is_unaffected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = OutputCache::builder(CacheConfig::default())
        .provider(Arc::new(FailingProvider { fail_get: false }))
        .build();
    let mut events = cache.subscribe();
    let app = counted_app(cache, Arc::clone(&calls));

    let response = send(&app, get_request("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(indicator(&response), Some("ms"));

    let errors: Vec<ProviderOp> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            CacheEvent::ProviderError { operation, .. } => Some(operation),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ProviderOp::Set]);
}

#[tokio::test]
async fn hit_event_carries_the_entry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = OutputCache::new(CacheConfig::default());
    let mut events = cache.subscribe();
    let app = counted_app(cache, Arc::clone(&calls));

    send(&app, get_request("/redirect")).await;
    send(&app, get_request("/redirect")).await;

    let hit = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            CacheEvent::Hit(entry) => Some(entry),
            _ => None,
        })
        .expect("hit event");
    assert_eq!(hit.key, "p-/redirect");
    assert_eq!(hit.status, 301);
    assert_eq!(hit.redirect_target.as_deref(), Some("/target"));
    assert_eq!(hit.original_path.as_deref(), Some("/redirect"));
}

#[tokio::test]
async fn event_stream_responses_bypass_capture() {
    let cache = OutputCache::new(CacheConfig::default());
    let app = Router::new()
        .route(
            "/events",
            get(|| async {
                ([(CONTENT_TYPE, "text/event-stream")], "data: 1\n\n").into_response()
            }),
        )
        .layer(middleware::from_fn_with_state(cache, output_cache_layer));

    send(&app, get_request("/events")).await;
    let second = send(&app, get_request("/events")).await;

    assert_eq!(indicator(&second), Some("ms"));
    assert_eq!(body_string(second).await, "data: 1\n\n");
}

#[tokio::test]
async fn oversized_bodies_are_forwarded_but_not_stored() {
    let config = CacheConfig {
        max_body_bytes: 4,
        ..Default::default()
    };
    let cache = OutputCache::new(config);
    let app = Router::new()
        .route("/large", get(|| async { "more than four bytes" }))
        .layer(middleware::from_fn_with_state(cache, output_cache_layer));

    let first = send(&app, get_request("/large")).await;
    assert_eq!(body_string(first).await, "more than four bytes");

    let second = send(&app, get_request("/large")).await;
    assert_eq!(indicator(&second), Some("ms"));
}

fn endless_stream_app(config: CacheConfig) -> Router {
    let cache = OutputCache::new(config);
    Router::new()
        .route(
            "/download",
            get(|| async {
                let first = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(
                    b"0123456789",
                ))]);
                Body::from_stream(first.chain(futures::stream::pending()))
            }),
        )
        .layer(middleware::from_fn_with_state(cache, output_cache_layer))
}

async fn first_chunk(app: &Router, uri: &str) -> (Option<String>, Bytes) {
    let response = tokio::time::timeout(Duration::from_secs(5), send(app, get_request(uri)))
        .await
        .expect("response must not wait for the whole body");
    let status = indicator(&response).map(str::to_string);
    let frame = tokio::time::timeout(Duration::from_secs(5), response.into_body().frame())
        .await
        .expect("first frame")
        .expect("body frame")
        .expect("frame");
    (status, frame.into_data().expect("data frame"))
}

#[tokio::test]
async fn streamed_bodies_are_not_held_when_skipping() {
    let app = endless_stream_app(CacheConfig::default());

    let (status, chunk) = first_chunk(&app, "/download?cache=false").await;

    assert_eq!(status.as_deref(), Some("ms"));
    assert_eq!(chunk, Bytes::from_static(b"0123456789"));
}

#[tokio::test]
async fn streamed_bodies_over_the_limit_pass_through_on_miss() {
    let app = endless_stream_app(CacheConfig {
        max_body_bytes: 4,
        ..Default::default()
    });

    let (status, chunk) = first_chunk(&app, "/download").await;

    assert_eq!(status.as_deref(), Some("ms"));
    assert_eq!(chunk, Bytes::from_static(b"0123456789"));
}

#[tokio::test]
async fn long_undeclared_bodies_are_forwarded_whole_but_not_stored() {
    let cache = OutputCache::new(CacheConfig {
        max_body_bytes: 4,
        ..Default::default()
    });
    let app = Router::new()
        .route(
            "/chunks",
            get(|| async {
                let chunks =
                    (0..1000).map(|_| Ok::<_, std::io::Error>(Bytes::from_static(b"abcdefghij")));
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .layer(middleware::from_fn_with_state(cache, output_cache_layer));

    for _ in 0..2 {
        let response = send(&app, get_request("/chunks")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(indicator(&response), Some("ms"));
        assert_eq!(body_string(response).await.len(), 10_000);
    }
}

#[tokio::test]
async fn largest_max_age_is_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cache = OutputCache::new(CacheConfig::default());
    let app = Router::new()
        .route(
            "/forever",
            get(move || {
                let calls = Arc::clone(&counter);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(CACHE_CONTROL, "max-age=18446744073709551615")], "forever")
                }
            }),
        )
        .layer(middleware::from_fn_with_state(cache, output_cache_layer));

    send(&app, get_request("/forever")).await;
    let second = send(&app, get_request("/forever")).await;

    assert_eq!(indicator(&second), Some("ht 18446744073709551615 0"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
