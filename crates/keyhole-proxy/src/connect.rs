use std::io;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Parsed authority of a `CONNECT host:port` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectParseError {
    IncompleteHeaders,
    InvalidUtf8,
    EmptyRequestLine,
    InvalidRequestLine,
    MethodNotConnect,
    InvalidHttpVersion,
    InvalidAuthority,
    MissingPort,
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

/// Parses a complete CONNECT head, returning the request and the number of
/// bytes the head consumed (anything after it belongs to the tunneled
/// stream).
pub fn parse_connect_request_head(
    input: &[u8],
) -> Result<(ConnectRequest, usize), ConnectParseError> {
    let header_end = header_terminator_index(input).ok_or(ConnectParseError::IncompleteHeaders)?;
    let head =
        std::str::from_utf8(&input[..header_end]).map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or(ConnectParseError::EmptyRequestLine)?;
    let request = parse_connect_request_line(request_line)?;
    Ok((request, header_end))
}

/// Strict authority-form parse: the method must be uppercase `CONNECT` and
/// the authority must carry an explicit port. A cloud CLI always sends both;
/// anything else is a client bug worth surfacing.
pub fn parse_connect_request_line(request_line: &str) -> Result<ConnectRequest, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;

    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }
    if method != "CONNECT" {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    let (server_host, server_port) = parse_connect_authority(authority)?;
    Ok(ConnectRequest {
        server_host,
        server_port,
    })
}

fn parse_connect_authority(authority: &str) -> Result<(String, u16), ConnectParseError> {
    if authority.starts_with('[') {
        let bracket_close = authority
            .find(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }

        let suffix = &authority[bracket_close + 1..];
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        if port_text.is_empty() {
            return Err(ConnectParseError::MissingPort);
        }
        let server_port = port_text
            .parse::<u16>()
            .map_err(|_| ConnectParseError::InvalidPort)?;
        return Ok((host.to_string(), server_port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(ConnectParseError::MissingPort)?;
    if host.is_empty() {
        return Err(ConnectParseError::InvalidAuthority);
    }
    // A colon still in the host means an unbracketed IPv6 literal.
    if host.contains(':') {
        return Err(ConnectParseError::InvalidAuthority);
    }
    if port_text.is_empty() {
        return Err(ConnectParseError::MissingPort);
    }

    let server_port = port_text
        .parse::<u16>()
        .map_err(|_| ConnectParseError::InvalidPort)?;
    Ok((host.to_string(), server_port))
}

fn header_terminator_index(input: &[u8]) -> Option<usize> {
    input
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

/// Reads the CONNECT head byte-wise until the blank line, bounded by
/// `max_connect_head_bytes`.
pub(crate) async fn read_connect_head(
    stream: &mut TcpStream,
    max_connect_head_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(1024);
    let mut byte = [0_u8; 1];

    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before CONNECT headers completed",
            ));
        }

        data.push(byte[0]);
        if data.len() > max_connect_head_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT header exceeded configured limit",
            ));
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::{parse_connect_request_head, parse_connect_request_line, ConnectParseError};

    #[test]
    fn parses_canonical_connect_line() {
        let parsed =
            parse_connect_request_line("CONNECT compute.googleapis.com:443 HTTP/1.1")
                .expect("canonical line");
        assert_eq!(parsed.server_host, "compute.googleapis.com");
        assert_eq!(parsed.server_port, 443);
    }

    #[test]
    fn parses_bracketed_ipv6_authority() {
        let parsed = parse_connect_request_line("CONNECT [2001:db8::1]:8443 HTTP/1.1")
            .expect("ipv6 line");
        assert_eq!(parsed.server_host, "2001:db8::1");
        assert_eq!(parsed.server_port, 8443);
    }

    #[test]
    fn head_parse_reports_consumed_length() {
        let head = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\nleftover";
        let (parsed, consumed) = parse_connect_request_head(head).expect("head parse");
        assert_eq!(parsed.server_host, "api.example.com");
        assert_eq!(&head[consumed..], b"leftover");
    }

    #[test]
    fn rejects_non_connect_methods() {
        let error = parse_connect_request_line("GET http://example.com/ HTTP/1.1")
            .expect_err("GET is not CONNECT");
        assert_eq!(error, ConnectParseError::MethodNotConnect);

        let error = parse_connect_request_line("connect example.com:443 HTTP/1.1")
            .expect_err("lowercase method");
        assert_eq!(error, ConnectParseError::MethodNotConnect);
    }

    #[test]
    fn rejects_malformed_authorities() {
        let cases = [
            ("CONNECT example.com HTTP/1.1", ConnectParseError::MissingPort),
            ("CONNECT example.com: HTTP/1.1", ConnectParseError::MissingPort),
            (
                "CONNECT example.com:badport HTTP/1.1",
                ConnectParseError::InvalidPort,
            ),
            (
                "CONNECT example.com:70000 HTTP/1.1",
                ConnectParseError::InvalidPort,
            ),
            ("CONNECT :443 HTTP/1.1", ConnectParseError::InvalidAuthority),
            (
                "CONNECT 2001:db8::1:443 HTTP/1.1",
                ConnectParseError::InvalidAuthority,
            ),
            (
                "CONNECT [2001:db8::1] HTTP/1.1",
                ConnectParseError::MissingPort,
            ),
            ("CONNECT example.com:443 FTP/1.1", ConnectParseError::InvalidHttpVersion),
            (
                "CONNECT example.com:443 HTTP/1.1 extra",
                ConnectParseError::InvalidRequestLine,
            ),
        ];
        for (line, expected) in cases {
            let error = parse_connect_request_line(line).expect_err(line);
            assert_eq!(error, expected, "{line}");
        }
    }

    #[test]
    fn incomplete_head_is_reported() {
        let error = parse_connect_request_head(b"CONNECT example.com:443 HTTP/1.1\r\n")
            .expect_err("missing blank line");
        assert_eq!(error, ConnectParseError::IncompleteHeaders);
    }
}
