use std::collections::HashSet;
use std::io;

use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

use crate::errors::ProxyError;
use crate::http1::{HttpHeader, HttpRequestHead};

/// Audit annotation header consumed by the upstream API.
pub const REASON_HEADER: &str = "x-goog-request-reason";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Rewrites decrypted request heads before they go upstream: the
/// Authorization header is unconditionally replaced with the session's
/// bearer token and the audit reason header is set. Everything else is
/// forwarded as received, minus hop-by-hop headers.
pub(crate) struct HeaderInjector {
    authorization: HeaderValue,
    reason: HeaderValue,
}

impl HeaderInjector {
    pub(crate) fn new(token: &str, reason: &str) -> Result<Self, ProxyError> {
        let authorization = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(|_| ProxyError::InvalidConfig("access token is not header-safe".to_string()))?;
        let reason = HeaderValue::try_from(reason)
            .map_err(|_| ProxyError::InvalidConfig("reason is not header-safe".to_string()))?;
        Ok(Self {
            authorization,
            reason,
        })
    }

    /// Serializes the rewritten head, preserving the original request line.
    /// Transfer-Encoding survives the hop-by-hop strip: the body is relayed
    /// verbatim, so its framing header must reach the origin.
    pub(crate) fn rewrite_head(&self, head: &HttpRequestHead) -> io::Result<Vec<u8>> {
        let headers = header_map_from(&head.headers)?;
        let mut rewritten = strip_hop_by_hop(&headers);
        rewritten.insert(AUTHORIZATION, self.authorization.clone());
        rewritten.insert(HeaderName::from_static(REASON_HEADER), self.reason.clone());

        let mut serialized = Vec::with_capacity(256);
        serialized.extend_from_slice(head.method.as_bytes());
        serialized.push(b' ');
        serialized.extend_from_slice(head.target.as_bytes());
        serialized.push(b' ');
        serialized.extend_from_slice(head.version.as_str().as_bytes());
        serialized.extend_from_slice(b"\r\n");
        for (name, value) in &rewritten {
            serialized.extend_from_slice(name.as_str().as_bytes());
            serialized.extend_from_slice(b": ");
            serialized.extend_from_slice(value.as_bytes());
            serialized.extend_from_slice(b"\r\n");
        }
        serialized.extend_from_slice(b"\r\n");
        Ok(serialized)
    }
}

fn header_map_from(headers: &[HttpHeader]) -> io::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header name"))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header value"))?;
        map.append(name, value);
    }
    Ok(map)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut blocked = blocked_header_names(headers);
    blocked.remove(&HeaderName::from_static("transfer-encoding"));

    let mut rewritten = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if blocked.contains(name) {
            continue;
        }
        rewritten.append(name.clone(), value.clone());
    }
    rewritten
}

fn blocked_header_names(headers: &HeaderMap) -> HashSet<HeaderName> {
    let mut blocked = HashSet::with_capacity(HOP_BY_HOP_HEADERS.len() + 4);
    for header in HOP_BY_HOP_HEADERS {
        blocked.insert(HeaderName::from_static(header));
    }

    for token in parse_connection_tokens(headers) {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            blocked.insert(name);
        }
    }
    blocked
}

fn parse_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut tokens = Vec::new();
    for value in headers.get_all(HeaderName::from_static("connection")) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for token in raw.split(',') {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                tokens.push(trimmed.to_ascii_lowercase());
            }
        }
    }
    tokens
}
