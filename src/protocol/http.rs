//! HTTP/1.1 message layer
//!
//! Request-level routing needs just enough HTTP to pull one request off an
//! inbound connection, replay it to a worker stream, and relay the worker's
//! response back. Messages are fully buffered: headers plus a body framed by
//! Content-Length or chunked transfer encoding (chunked bodies are decoded
//! and re-framed with an explicit length before forwarding).
//!
//! This is not a general HTTP implementation: no continuation lines, no
//! connection management, no header canonicalization. Header names keep
//! their original spelling and order so a forwarded request reads the same
//! as the one received.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

// ============================================================================
// Limits
// ============================================================================

/// Maximum length of one start line or header line.
const MAX_LINE_LEN: usize = 8 * 1024;

/// Maximum number of headers per message.
const MAX_HEADER_COUNT: usize = 128;

/// Maximum buffered body size (16 MiB).
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

// ============================================================================
// Request
// ============================================================================

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse one request from a buffered reader.
    ///
    /// Returns [`Error::Closed`] on a clean EOF before the first byte, which
    /// is how a keep-alive connection ends between requests.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let start = read_line(r).await?;
        let mut parts = start.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::Protocol("empty request line".into()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| Error::Protocol("request line missing target".into()))?
            .to_string();
        let version = parts
            .next()
            .ok_or_else(|| Error::Protocol("request line missing version".into()))?
            .to_string();
        if !version.starts_with("HTTP/") {
            return Err(Error::Protocol(format!("bad HTTP version: {}", version)));
        }

        let mut headers = read_headers(r).await?;
        let body = read_body(r, &headers, false).await?;
        reframe_if_chunked(&mut headers, body.len());

        Ok(Self {
            method,
            target,
            version,
            headers,
            body,
        })
    }

    /// Serialize the request: start line, headers in original order, body.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.method.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.target.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf.extend_from_slice(&self.body);
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// The Host header, verbatim (port included), or empty when absent.
    pub fn host(&self) -> &str {
        header_value(&self.headers, "host").unwrap_or("")
    }

    /// The request path: the target stripped of any query string, with
    /// absolute-form targets reduced to their path component.
    pub fn path(&self) -> &str {
        let target = self.target.split('?').next().unwrap_or(&self.target);
        if let Some(rest) = target
            .strip_prefix("http://")
            .or_else(|| target.strip_prefix("https://"))
        {
            return rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        }
        target
    }
}

// ============================================================================
// Response
// ============================================================================

/// A parsed HTTP/1.1 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Parse one response from a buffered reader. `head` marks a response to
    /// a HEAD request, which carries headers but never a body.
    pub async fn read_from<R>(r: &mut R, head: bool) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let start = read_line(r).await?;
        let mut parts = start.splitn(3, ' ');
        let version = parts
            .next()
            .filter(|v| v.starts_with("HTTP/"))
            .ok_or_else(|| Error::Protocol("bad status line".into()))?
            .to_string();
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("bad status code".into()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = read_headers(r).await?;
        let bodyless = head || status / 100 == 1 || status == 204 || status == 304;
        let body = if bodyless {
            Vec::new()
        } else {
            read_body(r, &headers, true).await?
        };
        reframe_if_chunked(&mut headers, body.len());

        Ok(Self {
            version,
            status,
            reason,
            headers,
            body,
        })
    }

    /// Serialize the response: status line, headers in original order, body.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.version.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf.extend_from_slice(&self.body);
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// The synthetic response sent when no worker matches a request within
    /// the route timeout.
    pub fn not_found() -> Self {
        let body = b"Not Found".to_vec();
        Self {
            version: "HTTP/1.1".to_string(),
            status: 404,
            reason: "Not Found".to_string(),
            headers: vec![("Content-Length".to_string(), body.len().to_string())],
            body,
        }
    }

    /// Minimal success response with the given body, for workers that answer
    /// requests directly.
    pub fn ok_with_body(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            version: "HTTP/1.1".to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: vec![("Content-Length".to_string(), body.len().to_string())],
            body,
        }
    }
}

// ============================================================================
// Shared parsing helpers
// ============================================================================

/// Read one CRLF- (or bare LF-) terminated line, without the terminator.
/// EOF before any byte is [`Error::Closed`]; EOF mid-line is a protocol
/// error.
async fn read_line<R>(r: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Err(Error::Closed);
            }
            return Err(Error::Protocol("unexpected EOF in message".into()));
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            r.consume(pos + 1);
            break;
        }
        line.extend_from_slice(buf);
        let n = buf.len();
        r.consume(n);
        if line.len() > MAX_LINE_LEN {
            return Err(Error::Protocol("line too long".into()));
        }
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    if line.len() > MAX_LINE_LEN {
        return Err(Error::Protocol("line too long".into()));
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn read_headers<R>(r: &mut R) -> Result<Vec<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = match read_line(r).await {
            Ok(line) => line,
            Err(Error::Closed) => {
                return Err(Error::Protocol("unexpected EOF in headers".into()))
            }
            Err(e) => return Err(e),
        };
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(Error::Protocol("too many headers".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed header: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

/// Read a message body according to its framing headers. `eof_delimited`
/// allows the response case where neither Content-Length nor chunked is
/// present and the body runs to connection close.
async fn read_body<R>(
    r: &mut R,
    headers: &[(String, String)],
    eof_delimited: bool,
) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if is_chunked(headers) {
        return read_chunked_body(r).await;
    }

    if let Some(len) = header_value(headers, "content-length") {
        let len: usize = len
            .parse()
            .map_err(|_| Error::Protocol(format!("bad Content-Length: {}", len)))?;
        if len > MAX_BODY_LEN {
            return Err(Error::Protocol(format!("body of {} bytes too large", len)));
        }
        let mut body = vec![0u8; len];
        r.read_exact(&mut body)
            .await
            .map_err(|e| Error::Protocol(format!("short body: {}", e)))?;
        return Ok(body);
    }

    if eof_delimited {
        let mut body = Vec::new();
        (&mut *r)
            .take(MAX_BODY_LEN as u64 + 1)
            .read_to_end(&mut body)
            .await?;
        if body.len() > MAX_BODY_LEN {
            return Err(Error::Protocol("body too large".into()));
        }
        return Ok(body);
    }

    Ok(Vec::new())
}

async fn read_chunked_body<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(r).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::Protocol(format!("bad chunk size: {}", size_str)))?;
        if body.len() + size > MAX_BODY_LEN {
            return Err(Error::Protocol("chunked body too large".into()));
        }
        if size == 0 {
            // Trailer section, discarded.
            loop {
                let trailer = read_line(r).await?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }
        let start = body.len();
        body.resize(start + size, 0);
        r.read_exact(&mut body[start..])
            .await
            .map_err(|e| Error::Protocol(format!("short chunk: {}", e)))?;
        let sep = read_line(r).await?;
        if !sep.is_empty() {
            return Err(Error::Protocol("chunk missing terminator".into()));
        }
    }
}

/// A decoded chunked body is forwarded with an explicit length: the
/// Transfer-Encoding header is dropped and Content-Length takes its place.
fn reframe_if_chunked(headers: &mut Vec<(String, String)>, body_len: usize) {
    if !is_chunked(headers) {
        return;
    }
    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"));
    headers.push(("Content-Length".to_string(), body_len.to_string()));
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn write_headers(buf: &mut Vec<u8>, headers: &[(String, String)]) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse_request(raw: &str) -> Result<Request> {
        let mut reader = BufReader::new(raw.as_bytes());
        Request::read_from(&mut reader).await
    }

    #[tokio::test]
    async fn parses_get_without_body() {
        let req = parse_request("GET /a/b?q=1 HTTP/1.1\r\nHost: example.com:8999\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/a/b?q=1");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.host(), "example.com:8999");
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let req = parse_request("POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn parses_chunked_body_and_reframes() {
        let raw = "POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                   4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let req = parse_request(raw).await.unwrap();
        assert_eq!(req.body, b"Wikipedia");
        assert!(header_value(&req.headers, "transfer-encoding").is_none());
        assert_eq!(header_value(&req.headers, "content-length"), Some("9"));
    }

    #[tokio::test]
    async fn absolute_form_target_reduces_to_path() {
        let req = parse_request("GET http://example.com/a/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.path(), "/a/");
    }

    #[tokio::test]
    async fn clean_eof_reports_closed() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(matches!(
            Request::read_from(&mut reader).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn truncated_headers_are_an_error() {
        assert!(matches!(
            parse_request("GET / HTTP/1.1\r\nHost: exam").await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn request_serialization_round_trips() {
        let req = Request {
            method: "POST".to_string(),
            target: "/submit".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Content-Length".to_string(), "3".to_string()),
            ],
            body: b"abc".to_vec(),
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).await.unwrap();
        let mut reader = BufReader::new(buf.as_slice());
        let parsed = Request::read_from(&mut reader).await.unwrap();
        assert_eq!(parsed, req);
    }

    #[tokio::test]
    async fn parses_response_with_content_length() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na";
        let mut reader = BufReader::new(raw.as_bytes());
        let res = Response::read_from(&mut reader, false).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.reason, "OK");
        assert_eq!(res.body, b"a");
    }

    #[tokio::test]
    async fn parses_eof_delimited_response() {
        let raw = "HTTP/1.1 200 OK\r\n\r\nstreamed until close";
        let mut reader = BufReader::new(raw.as_bytes());
        let res = Response::read_from(&mut reader, false).await.unwrap();
        assert_eq!(res.body, b"streamed until close");
    }

    #[tokio::test]
    async fn no_content_response_has_no_body() {
        let raw = "HTTP/1.1 204 No Content\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let res = Response::read_from(&mut reader, false).await.unwrap();
        assert!(res.body.is_empty());
    }

    #[tokio::test]
    async fn head_response_body_is_skipped() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let res = Response::read_from(&mut reader, true).await.unwrap();
        assert!(res.body.is_empty());
    }

    #[tokio::test]
    async fn not_found_serializes_with_correct_length() {
        let mut buf = Vec::new();
        Response::not_found().write_to(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\nNot Found"));
    }
}
