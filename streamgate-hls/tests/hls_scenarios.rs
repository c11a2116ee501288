//! End-to-end scenarios against the HLS router, driven in-process.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use std::net::SocketAddr;
use tower::ServiceExt;

use streamgate_core::Config;
use streamgate_hls::handoff::ClientAddr;
use streamgate_hls::HlsStreamer;

fn test_config() -> Config {
    let mut config = Config::default();
    config.streamer.hostname = "localhost:8000".to_string();
    config.streamer.mount_point = "/mount".to_string();
    config.streamer.description = "Title".to_string();
    config.session.secret = Some("00112233445566778899aabbccddeeff".to_string());
    config
}

fn streamer_with_fragments(config: Config, sequences: std::ops::RangeInclusive<u64>) -> HlsStreamer {
    let streamer = HlsStreamer::new(config).expect("streamer builds");
    let sink = streamer.sink();
    for seq in sequences {
        sink.add_fragment(Bytes::from(format!("body-{seq}")), seq, 2);
    }
    streamer
}

fn request(path: &str, addr: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path).method("GET");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    let addr: SocketAddr = format!("{addr}:34567").parse().expect("address");
    builder = builder.extension(ConnectInfo(ClientAddr(addr)));
    builder.body(Body::empty()).expect("request builds")
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn set_cookie(response: &axum::response::Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// The `flumotion-session=<value>` pair without attributes.
fn cookie_pair(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .next()
        .expect("cookie has a value")
        .to_string()
}

// S1: first fetch of the stream playlist.
#[tokio::test]
async fn test_first_fetch_renders_window() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let router = streamer.router();

    let response = router
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/vnd.apple.mpegurl")
    );
    let body = body_string(response).await;
    let expected = "#EXTM3U\n\
        #EXT-X-ALLOW-CACHE:YES\n\
        #EXT-X-TARGETDURATION:2\n\
        #EXT-X-MEDIA-SEQUENCE:1\n\
        #EXTINF:2,Title\n\
        http://localhost:8000/mount/fragment-1.webm\n\
        #EXTINF:2,Title\n\
        http://localhost:8000/mount/fragment-2.webm\n\
        #EXTINF:2,Title\n\
        http://localhost:8000/mount/fragment-3.webm\n\
        #EXTINF:2,Title\n\
        http://localhost:8000/mount/fragment-4.webm\n\
        #EXTINF:2,Title\n\
        http://localhost:8000/mount/fragment-5.webm\n";
    assert_eq!(body, expected);
}

#[tokio::test]
async fn test_main_playlist_and_fragment_types() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let router = streamer.router();

    let response = router
        .clone()
        .oneshot(request("/mount/main.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH=300000"));
    assert!(body.contains("http://localhost:8000/mount/stream.m3u8"));

    let response = router
        .oneshot(request("/mount/fragment-3.webm", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("video/mpeg")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok()),
        Some("close")
    );
    assert_eq!(body_string(response).await, "body-3");
}

// S2: the session cookie is set, touched, and replaced after expiry.
#[tokio::test(start_paused = true)]
async fn test_session_cookie_lifecycle() {
    let mut config = test_config();
    config.session.timeout_secs = 10;
    let streamer = streamer_with_fragments(config, 0..=5);
    let router = streamer.router();

    let response = router
        .clone()
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let first = set_cookie(&response).expect("cookie set on first request");
    assert!(first.starts_with("flumotion-session="));
    assert!(first.contains("Path=/mount/"));
    let cookie = cookie_pair(&first);

    // A follow-up with the cookie touches the session; no new cookie.
    tokio::time::advance(std::time::Duration::from_secs(8)).await;
    let response = router
        .clone()
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", Some(&cookie)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).is_none());

    // The touch reset the timer: 8 + 8 > 10 but the session is alive.
    tokio::time::advance(std::time::Duration::from_secs(8)).await;
    let response = router
        .clone()
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", Some(&cookie)))
        .await
        .expect("response");
    assert!(set_cookie(&response).is_none());

    // Idle past the timeout: the old cookie maps to an expired
    // session, so a fresh one is created and the cookie changes.
    tokio::time::advance(std::time::Duration::from_secs(11)).await;
    let response = router
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", Some(&cookie)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let renewed = set_cookie(&response).expect("new cookie issued");
    assert_ne!(cookie_pair(&renewed), cookie);
}

// S3: a token bound to one address is no cookie at all for another.
#[tokio::test]
async fn test_token_tamper_wrong_ip() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let router = streamer.router();

    let response = router
        .clone()
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    let cookie = cookie_pair(&set_cookie(&response).expect("cookie"));

    let response = router
        .oneshot(request("/mount/stream.m3u8", "5.6.7.8", Some(&cookie)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let reissued = set_cookie(&response).expect("fresh session for other address");
    assert_ne!(cookie_pair(&reissued), cookie);
}

// S6: eviction keeps the tail reachable while the playlist slides.
#[tokio::test]
async fn test_ring_eviction_scenario() {
    let mut config = test_config();
    config.hls.window = 3;
    config.hls.max_extra_buffers = Some(2);
    let streamer = streamer_with_fragments(config, 0..=10);
    let router = streamer.router();

    let response = router
        .clone()
        .oneshot(request("/mount/fragment-0.webm", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .clone()
        .oneshot(request("/mount/fragment-5.webm", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "body-5");

    let response = router
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    let body = body_string(response).await;
    assert!(body.contains("#EXT-X-MEDIA-SEQUENCE:8"));
    assert!(body.contains("fragment-8.webm"));
    assert!(body.contains("fragment-10.webm"));
    assert!(!body.contains("fragment-7.webm"));
}

#[tokio::test]
async fn test_not_ready_returns_503() {
    let streamer = HlsStreamer::new(test_config()).expect("streamer builds");
    let router = streamer.router();
    let response = router
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_outside_mount_is_forbidden() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let response = streamer
        .router()
        .oneshot(request("/elsewhere/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_method_not_allowed() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let addr: SocketAddr = "1.2.3.4:4000".parse().expect("address");
    let request = Request::builder()
        .uri("/mount/stream.m3u8")
        .method("POST")
        .extension(ConnectInfo(ClientAddr(addr)))
        .body(Body::empty())
        .expect("request builds");
    let response = streamer
        .router()
        .oneshot(request)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_client_cap_redirects_when_configured() {
    let mut config = test_config();
    config.streamer.max_clients = Some(1);
    config.streamer.redirect_on_overflow = Some("http://other.example.com/".to_string());
    let streamer = streamer_with_fragments(config, 0..=5);
    let router = streamer.router();

    let response = router
        .clone()
        .oneshot(request("/mount/stream.m3u8", "1.2.3.4", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(request("/mount/stream.m3u8", "9.9.9.9", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("http://other.example.com/")
    );
}

// GKID pins the session id for cross-replica continuity.
#[tokio::test]
async fn test_gkid_pins_session_id() {
    let streamer = streamer_with_fragments(test_config(), 0..=5);
    let router = streamer.router();

    let response = router
        .oneshot(request(
            "/mount/stream.m3u8?GKID=abcdef123456",
            "1.2.3.4",
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = set_cookie(&response).expect("cookie");
    // The token payload is base64("<sid>:<exp>:<sig>"); the sid is the
    // pinned GKID.
    let value = cookie_pair(&cookie);
    let (_, token) = value.split_once('=').expect("token value");
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .expect("base64 token");
    let decoded = String::from_utf8(decoded).expect("utf-8 token");
    assert!(decoded.starts_with("abcdef123456:"));
}
