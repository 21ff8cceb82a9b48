use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpHeader {
    pub(crate) name: String,
    pub(crate) value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: HttpVersion,
    pub(crate) headers: Vec<HttpHeader>,
    pub(crate) body_mode: HttpBodyMode,
    pub(crate) connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponseHead {
    pub(crate) raw: Vec<u8>,
    pub(crate) status_code: u16,
    pub(crate) body_mode: HttpBodyMode,
    pub(crate) connection_close: bool,
}

/// A stream plus whatever bytes were read past the last message boundary.
pub(crate) struct BufferedConn<S> {
    pub(crate) stream: S,
    read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

pub(crate) async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP header exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn parse_http_request_head(raw: &[u8]) -> io::Result<HttpRequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = parse_http_version(version_text)?;

    let headers = parse_http_headers(lines)?;
    let body_mode = parse_request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(HttpRequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub(crate) fn parse_http_response_head(
    raw: &[u8],
    request_method: &str,
) -> io::Result<HttpResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response status line is missing",
        )
    })?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let version = parse_http_version(version_text)?;
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;

    let headers = parse_http_headers(lines)?;
    let mut connection_close = is_connection_close(version, &headers);
    let body_mode = parse_response_body_mode(&headers, request_method, status_code)?;
    if body_mode == HttpBodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(HttpResponseHead {
        raw: raw.to_vec(),
        status_code,
        body_mode,
        connection_close,
    })
}

fn parse_http_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported through the intercept path",
        )),
    }
}

fn parse_http_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Vec<HttpHeader>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.push(HttpHeader {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}

fn parse_request_body_mode(headers: &[HttpHeader]) -> io::Result<HttpBodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::None)
}

fn parse_response_body_mode(
    headers: &[HttpHeader],
    request_method: &str,
    status_code: u16,
) -> io::Result<HttpBodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(HttpBodyMode::None);
    }

    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }

    Ok(HttpBodyMode::CloseDelimited)
}

fn parse_content_length(headers: &[HttpHeader]) -> io::Result<Option<u64>> {
    let mut value = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = header.value.parse::<u64>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
            })?;
            value = Some(parsed);
        }
    }
    Ok(value)
}

fn has_header_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

/// Copies one message body from `source` to `sink`, returning the byte count.
pub(crate) async fn relay_http_body<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mode: HttpBodyMode,
    max_http_head_bytes: usize,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    match mode {
        HttpBodyMode::None => Ok(0),
        HttpBodyMode::ContentLength(length) => relay_exact(source, sink, length).await,
        HttpBodyMode::Chunked => relay_chunked(source, sink, max_http_head_bytes).await,
        HttpBodyMode::CloseDelimited => relay_until_eof(source, sink).await,
    }
}

async fn relay_exact<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mut length: u64,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    if !source.read_buf.is_empty() && length > 0 {
        let take = std::cmp::min(length as usize, source.read_buf.len());
        sink.write_all(&source.read_buf[..take]).await?;
        source.read_buf.drain(..take);
        length -= take as u64;
        total += take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while length > 0 {
        let read = source
            .stream
            .read(&mut chunk[..std::cmp::min(IO_CHUNK_SIZE, length as usize)])
            .await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        sink.write_all(&chunk[..read]).await?;
        length -= read as u64;
        total += read as u64;
    }

    Ok(total)
}

async fn relay_chunked<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    max_http_head_bytes: usize,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let line = read_chunk_line(source).await?;
        sink.write_all(&line).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            let trailers = read_until_pattern(source, b"\r\n\r\n", max_http_head_bytes)
                .await?
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before chunked trailers completed",
                    )
                })?;
            sink.write_all(&trailers).await?;
            return Ok(total);
        }

        total += relay_exact(source, sink, chunk_len).await?;

        let chunk_terminator = read_exact_from_source(source, 2).await?;
        if chunk_terminator.as_slice() != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk terminator",
            ));
        }
        sink.write_all(&chunk_terminator).await?;
    }
}

async fn relay_until_eof<RS, WS>(source: &mut BufferedConn<RS>, sink: &mut WS) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    if !source.read_buf.is_empty() {
        sink.write_all(&source.read_buf).await?;
        total += source.read_buf.len() as u64;
        source.read_buf.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&chunk[..read]).await?;
        total += read as u64;
    }
    Ok(total)
}

async fn read_chunk_line<S: AsyncRead + Unpin>(
    source: &mut BufferedConn<S>,
) -> io::Result<Vec<u8>> {
    let line = read_until_pattern(source, b"\r\n", CHUNK_LINE_LIMIT)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk size line was read",
            )
        })?;
    Ok(line)
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

async fn read_exact_from_source<S: AsyncRead + Unpin>(
    source: &mut BufferedConn<S>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while source.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before fixed-length body completed",
            ));
        }
        source.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(source.read_buf.drain(..exact_len).collect::<Vec<_>>())
}

pub(crate) async fn write_proxy_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::{
        parse_chunk_len, parse_http_request_head, parse_http_response_head, HttpBodyMode,
        HttpVersion,
    };

    #[test]
    fn parses_request_head_with_body_mode() {
        let raw = b"POST /v1/instances HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 12\r\n\r\n";
        let head = parse_http_request_head(raw).expect("request head");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/v1/instances");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.body_mode, HttpBodyMode::ContentLength(12));
        assert!(!head.connection_close);
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_content_length() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n";
        let head = parse_http_request_head(raw).expect("request head");
        assert_eq!(head.body_mode, HttpBodyMode::Chunked);
    }

    #[test]
    fn http10_without_keep_alive_closes() {
        let raw = b"GET / HTTP/1.0\r\nHost: api.example.com\r\n\r\n";
        let head = parse_http_request_head(raw).expect("request head");
        assert!(head.connection_close);
    }

    #[test]
    fn response_without_length_is_close_delimited() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        let head = parse_http_response_head(raw, "GET").expect("response head");
        assert_eq!(head.body_mode, HttpBodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn head_and_204_responses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let head = parse_http_response_head(raw, "HEAD").expect("HEAD response");
        assert_eq!(head.body_mode, HttpBodyMode::None);

        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let head = parse_http_response_head(raw, "GET").expect("204 response");
        assert_eq!(head.body_mode, HttpBodyMode::None);
    }

    #[test]
    fn chunk_length_lines_parse_hex_and_extensions() {
        assert_eq!(parse_chunk_len(b"1a\r\n").expect("hex len"), 26);
        assert_eq!(parse_chunk_len(b"0\r\n").expect("zero len"), 0);
        assert_eq!(
            parse_chunk_len(b"8;name=value\r\n").expect("extension len"),
            8
        );
        assert!(parse_chunk_len(b"zz\r\n").is_err());
    }

    #[test]
    fn rejects_unsupported_versions() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        assert!(parse_http_request_head(raw).is_err());
    }
}
