//! The HTTP leaf serving playlists, fragments and keys.
//!
//! Every request walks the same gauntlet: readiness and overflow
//! gates, mount check, session resolution (cookie verify, renew, or
//! fresh authentication), then dispatch on the resource name.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use streamgate_core::httpauth::RequestInfo;
use streamgate_core::{CookieState, Error, Keycard, COOKIE_NAME};

use crate::playlist::M3U8_CONTENT_TYPE;
use crate::ring::RingError;
use crate::streamer::HlsState;

use crate::handoff::ClientAddr;

const SERVER_HEADER: &str = concat!("StreamgateHLS/", env!("CARGO_PKG_VERSION"));
const PLAYLIST_EXTENSION: &str = ".m3u8";
const FRAGMENT_CONTENT_TYPE: &str = "video/mpeg";
// Typo preserved for wire compatibility with existing clients.
const KEY_CONTENT_TYPE: &str = "binary/octect-stream";

const ERROR_TEMPLATE: &str = "<!doctype html public \"-//IETF//DTD HTML 2.0//EN\">\n\
<html>\n<head>\n  <title>{code} {reason}</title>\n</head>\n\
<body>\n<h2>{code} {reason}</h2>\n</body>\n</html>\n";

pub async fn handle(
    State(state): State<Arc<HlsState>>,
    ConnectInfo(ClientAddr(addr)): ConnectInfo<ClientAddr>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    if !state.is_ready() {
        debug!("not sending data, backend not ready");
        return error_response(StatusCode::SERVICE_UNAVAILABLE);
    }
    if state.reached_server_limits() {
        return handle_server_full(&state);
    }

    let path = request.uri().path().to_string();
    let Some(resource) = path.strip_prefix(state.mount_point.as_str()) else {
        debug!(path, mount = %state.mount_point, "request outside mount point");
        return error_response(StatusCode::FORBIDDEN);
    };
    let resource = resource.to_string();

    let args: Vec<(String, String)> = request
        .uri()
        .query()
        .and_then(|query| serde_urlencoded::from_str(query).ok())
        .unwrap_or_default();

    let session_cookie = match check_session(&state, request.headers(), addr, &args).await {
        Ok(cookie) => cookie,
        Err(response) => return response,
    };

    let mut response = if resource.ends_with(PLAYLIST_EXTENSION) {
        render_playlist(&state, &resource, &args)
    } else if resource == "key" && args.iter().any(|(k, _)| k == "key") {
        render_key(&state, &args)
    } else {
        render_fragment(&state, &resource)
    };

    if let Some(cookie) = session_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Associate the request with a session.
///
/// A valid cookie adopts (or, cross-replica, materializes) the
/// session; an expired authentication re-runs the bouncer keeping the
/// session id; anything else authenticates from scratch under a fresh
/// id, or the one pinned by `GKID`. Returns the cookie to set, if any.
async fn check_session(
    state: &Arc<HlsState>,
    headers: &HeaderMap,
    addr: std::net::SocketAddr,
    args: &[(String, String)],
) -> Result<Option<Cookie<'static>>, Response> {
    let client_ip = addr.ip().to_string();
    let gkid = args
        .iter()
        .find(|(key, _)| key == "GKID")
        .map(|(_, value)| value.clone());

    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(COOKIE_NAME) {
        match state
            .token
            .verify(cookie.value(), &client_ip, gkid.as_deref())
        {
            CookieState::Valid { session_id } => {
                if state.sessions.touch(&session_id) {
                    return Ok(None);
                }
                if !state.sessions.was_expired_here(&session_id) {
                    // Unknown here but carrying a valid signature:
                    // another replica created it. Materialize it.
                    debug!(session_id, "replicating session");
                    create_session(state, &session_id, &client_ip);
                    return Ok(Some(build_cookie(state, &session_id, &client_ip, 0)));
                }
                // The session timed out on this streamer; fall through
                // and authenticate from scratch under a fresh id.
                debug!(session_id, "session expired, discarding cookie");
            }
            CookieState::RenewAuth { session_id, .. } => {
                debug!(session_id, "renewing authentication");
                let keycard = authenticate(state, headers, addr, args, &session_id).await?;
                let expiry = auth_expiry(keycard.as_ref());
                if !state.sessions.touch(&session_id) {
                    create_session(state, &session_id, &client_ip);
                }
                return Ok(Some(build_cookie(state, &session_id, &client_ip, expiry)));
            }
            CookieState::NotValid => {
                debug!("cookie not valid, starting fresh authentication");
            }
        }
    }

    let session_id = gkid.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let keycard = authenticate(state, headers, addr, args, &session_id).await?;
    let expiry = auth_expiry(keycard.as_ref());
    create_session(state, &session_id, &client_ip);
    Ok(Some(build_cookie(state, &session_id, &client_ip, expiry)))
}

/// Run the auth layer; convert failures to the right responses.
async fn authenticate(
    state: &Arc<HlsState>,
    headers: &HeaderMap,
    addr: std::net::SocketAddr,
    args: &[(String, String)],
    client_id: &str,
) -> Result<Option<Keycard>, Response> {
    let info = RequestInfo {
        client_ip: addr.ip(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        token: args
            .iter()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.clone()),
    };
    match state.auth.start_authentication(&info, client_id).await {
        Ok(keycard) => Ok(Some(keycard)),
        Err(Error::NotAuthenticated) => {
            info!(client_ip = %addr.ip(), "client unauthorized");
            Err(unauthorized_response(state))
        }
        Err(e) => {
            info!(error = %e, "authentication failure");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn auth_expiry(keycard: Option<&Keycard>) -> u64 {
    match keycard {
        Some(card) if card.duration != 0 => {
            (chrono::Utc::now().timestamp().max(0) as u64) + card.duration
        }
        _ => 0,
    }
}

fn create_session(state: &Arc<HlsState>, session_id: &str, client_ip: &str) {
    if state.sessions.create(session_id, client_ip) {
        state.stats.client_added();
        let stats = Arc::clone(&state.stats);
        let auth = Arc::clone(&state.auth);
        let sid = session_id.to_string();
        state.sessions.notify_on_expire(session_id, move || {
            stats.client_removed();
            tokio::spawn(async move {
                auth.cleanup_auth(&sid).await;
            });
        });
        debug!(session_id, "added new client");
    }
}

fn build_cookie(
    state: &Arc<HlsState>,
    session_id: &str,
    client_ip: &str,
    auth_expiry: u64,
) -> Cookie<'static> {
    let token = state.token.generate(session_id, client_ip, auth_expiry);
    Cookie::build((COOKIE_NAME, token))
        .path(state.mount_point.clone())
        .build()
}

fn render_playlist(state: &Arc<HlsState>, resource: &str, args: &[(String, String)]) -> Response {
    let rendered = {
        let ring = state.ring.lock();
        state.renderer.render(&ring, resource, args)
    };
    match rendered {
        Ok(playlist) => {
            state.stats.add_bytes(playlist.len() as u64);
            ok_response(playlist.into_bytes(), M3U8_CONTENT_TYPE, false)
        }
        Err(e) => not_found(e),
    }
}

fn render_key(state: &Arc<HlsState>, args: &[(String, String)]) -> Response {
    let name = args
        .iter()
        .find(|(key, _)| key == "key")
        .map(|(_, value)| value.as_str())
        .unwrap_or_default();
    match state.ring.lock().get_key(name) {
        Ok(key) => {
            state.stats.add_bytes(key.len() as u64);
            ok_response(key.to_vec(), KEY_CONTENT_TYPE, false)
        }
        Err(e) => not_found(e),
    }
}

fn render_fragment(state: &Arc<HlsState>, resource: &str) -> Response {
    match state.ring.lock().get(resource) {
        Ok(body) => {
            state.stats.add_bytes(body.len() as u64);
            ok_response(body.to_vec(), FRAGMENT_CONTENT_TYPE, true)
        }
        Err(e) => not_found(e),
    }
}

fn not_found(error: RingError) -> Response {
    debug!(%error, "resource not found");
    error_response(StatusCode::NOT_FOUND)
}

fn base_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
}

fn ok_response(body: Vec<u8>, content_type: &'static str, close: bool) -> Response {
    let mut response = Response::new(body.into());
    base_headers(&mut response);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.headers_mut().insert(
        header::CONNECTION,
        HeaderValue::from_static(if close { "close" } else { "Keep-Alive" }),
    );
    response
}

fn error_response(status: StatusCode) -> Response {
    let body = ERROR_TEMPLATE
        .replace("{code}", status.as_str())
        .replace("{reason}", status.canonical_reason().unwrap_or(""));
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    base_headers(&mut response);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html"),
    );
    response
}

fn unauthorized_response(state: &Arc<HlsState>) -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED);
    if let Some(domain) = state.auth.domain() {
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{domain}\"")) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

fn handle_server_full(state: &Arc<HlsState>) -> Response {
    if let Some(url) = &state.redirect_on_overflow {
        if let Ok(value) = HeaderValue::from_str(url) {
            let mut response = error_response(StatusCode::FOUND);
            response.headers_mut().insert(header::LOCATION, value);
            return response;
        }
    }
    debug!("refusing client, server limits reached");
    error_response(StatusCode::SERVICE_UNAVAILABLE)
}
