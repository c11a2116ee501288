//! First-line parsing for the wire protocols the porter fronts.
//!
//! The porter reads exactly one request line and decides on it alone;
//! everything after travels to the backend untouched. Both HTTP-like
//! protocols share the `METHOD TARGET PROTO` shape and differ only in
//! the accepted protocol versions and error dialect.

use rand::Rng;
use url::Url;

/// Request-id query parameter injected into forwarded request lines.
pub const REQUEST_ID_PARAMETER: &str = "FLUREQID";

/// Line terminators accepted on the first line. `\r` alone is enough
/// because a following `\n` is forwarded harmlessly with the rest.
pub const DELIMITERS: [&str; 3] = ["\r\n", "\n", "\r"];

/// Protocol family accepted on the public socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Http,
    Rtsp,
}

impl WireProtocol {
    #[must_use]
    pub fn accepted_versions(&self) -> &'static [&'static str] {
        match self {
            Self::Http => &["HTTP/1.0", "HTTP/1.1"],
            Self::Rtsp => &["RTSP/1.0"],
        }
    }

    fn dialect(&self) -> &'static str {
        match self {
            Self::Http => "HTTP/1.0",
            Self::Rtsp => "RTSP/1.0",
        }
    }

    #[must_use]
    pub fn not_found_response(&self) -> String {
        format!("{} 404 Not Found\r\n\r\nResource unknown", self.dialect())
    }

    #[must_use]
    pub fn service_unavailable_response(&self) -> String {
        format!(
            "{} 503 Service Unavailable\r\n\r\nService temporarily unavailable",
            self.dialect()
        )
    }

    /// Parse the first request line, or None when it is not a valid
    /// line of this protocol.
    #[must_use]
    pub fn parse_line(&self, line: &str) -> Option<RequestLine> {
        let mut parts = line.splitn(3, ' ');
        let method = parts.next()?.trim();
        let target = parts.next()?.trim();
        let proto = parts.next()?.trim();
        if method.is_empty() || target.is_empty() {
            return None;
        }
        if !self.accepted_versions().contains(&proto) {
            return None;
        }
        let target = Target::parse(target)?;
        Some(RequestLine {
            method: method.to_string(),
            target,
            proto: proto.to_string(),
        })
    }
}

/// The request target, kept in its original form so the rebuilt line
/// matches what the client sent.
#[derive(Debug, Clone)]
pub enum Target {
    /// Origin form: `/path` with an optional query string.
    Origin {
        path: String,
        query: Option<String>,
    },
    /// Absolute form: `scheme://host[:port]/path…`.
    Absolute(Url),
    /// The `*` form used by RTSP and OPTIONS requests.
    Asterisk,
}

impl Target {
    fn parse(target: &str) -> Option<Self> {
        if target == "*" {
            return Some(Self::Asterisk);
        }
        if target.contains("://") {
            let url = Url::parse(target).ok()?;
            if !url.has_host() {
                return None;
            }
            return Some(Self::Absolute(url));
        }
        if !target.starts_with('/') {
            return None;
        }
        match target.split_once('?') {
            Some((path, query)) => Some(Self::Origin {
                path: path.to_string(),
                query: Some(query.to_string()),
            }),
            None => Some(Self::Origin {
                path: target.to_string(),
                query: None,
            }),
        }
    }
}

/// A parsed first request line.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub target: Target,
    pub proto: String,
}

impl RequestLine {
    /// The routing identifier: the URL path.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match &self.target {
            Target::Origin { path, .. } => path,
            Target::Absolute(url) => url.path(),
            Target::Asterisk => "*",
        }
    }

    /// Mix a request id into the query string. Returns false when the
    /// target cannot carry one (the `*` form), in which case the line
    /// is left untouched.
    pub fn inject_request_id(&mut self, request_id: &str) -> bool {
        match &mut self.target {
            Target::Origin { query, .. } => {
                let appended = format!("{REQUEST_ID_PARAMETER}={request_id}");
                *query = Some(match query.take() {
                    Some(existing) if !existing.is_empty() => {
                        format!("{existing}&{appended}")
                    }
                    _ => appended,
                });
                true
            }
            Target::Absolute(url) => {
                url.query_pairs_mut()
                    .append_pair(REQUEST_ID_PARAMETER, request_id);
                true
            }
            Target::Asterisk => false,
        }
    }

    /// Rebuild the request line (without the terminator).
    #[must_use]
    pub fn unparse(&self) -> String {
        let target = match &self.target {
            Target::Origin { path, query } => match query {
                Some(query) => format!("{path}?{query}"),
                None => path.clone(),
            },
            Target::Absolute(url) => url.to_string(),
            Target::Asterisk => "*".to_string(),
        };
        format!("{} {} {}", self.method, target, self.proto)
    }
}

/// 256 bits of lowercase hex; needs no quoting inside a query string.
#[must_use]
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Split the accumulated buffer at the first line terminator. Returns
/// the line, the terminator that ended it, and the remaining bytes.
#[must_use]
pub fn split_first_line(buffer: &[u8]) -> Option<(&[u8], &'static str, &[u8])> {
    let mut best: Option<(usize, &'static str)> = None;
    for delim in DELIMITERS {
        if let Some(pos) = find(buffer, delim.as_bytes()) {
            if best.is_none_or(|(b, _)| pos < b) {
                best = Some((pos, delim));
            }
        }
    }
    let (pos, delim) = best?;
    Some((&buffer[..pos], delim, &buffer[pos + delim.len()..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
