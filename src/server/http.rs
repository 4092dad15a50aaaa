/*!
HTTP helpers for the agent edge: tolerant request parsing and response serialization.

This module keeps a minimal request model and reads a single HTTP/1.1 request from an
async buffered reader, accepting both CRLF and bare LF line endings, with a 64 KiB cap
on the header block and a configurable cap on the body. Bodies may be sized by
Content-Length or sent with Transfer-Encoding: chunked.

Arguments are merged the way the coordinator expects: query string first, then
urlencoded or multipart form fields, in arrival order. Multipart file parts are kept
apart as uploaded files keyed by their form field name.
*/

use std::collections::HashMap;
use std::fmt;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::multipart;

const HDR_CAP: usize = 64 * 1024;

/// Supported HTTP methods (minimal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other(String),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Other(m) => f.write_str(m),
        }
    }
}

/// Simple case-insensitive header map (keys lowercased)
pub type HeaderMap = HashMap<String, String>;

/// File part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Form field name; group creation uses it as the target filename.
    pub field: String,
    pub filename: Option<String>,
    pub body: Vec<u8>,
}

/// Parsed HTTP request (path kept verbatim, headers lowercased)
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Query and form arguments in arrival order; keys may repeat.
    pub args: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
}

impl HttpRequest {
    pub fn new(method: Method, path: &str) -> Self {
        HttpRequest {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            args: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// First value of an argument.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated argument, in order.
    pub fn arguments(&self, name: &str) -> Vec<&str> {
        self.args
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Why a request could not be read.
#[derive(Debug)]
pub enum RequestError {
    /// Peer closed before sending anything; nothing to answer.
    Closed,
    HeadersTooLarge,
    BodyTooLarge,
    Malformed(String),
    Io(io::Error),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Closed => f.write_str("connection closed"),
            RequestError::HeadersTooLarge => f.write_str("request headers too large"),
            RequestError::BodyTooLarge => f.write_str("request body too large"),
            RequestError::Malformed(m) => write!(f, "malformed request: {m}"),
            RequestError::Io(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Read one request. `max_body` caps the decoded body size.
pub async fn read_http_request<R>(reader: &mut R, max_body: usize) -> Result<HttpRequest, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header_len = 0usize;
    let mut lines: Vec<String> = Vec::new();
    loop {
        let mut line = Vec::new();
        let budget = (HDR_CAP + 1).saturating_sub(header_len) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            if lines.is_empty() {
                return Err(RequestError::Closed);
            }
            return Err(RequestError::Malformed("unexpected end of headers".into()));
        }
        header_len += n;
        if header_len > HDR_CAP {
            return Err(RequestError::HeadersTooLarge);
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            // Tolerate stray blank lines before the request line
            if lines.is_empty() {
                continue;
            }
            break;
        }
        lines.push(trimmed.to_string());
    }

    let (method, path, mut args) = parse_request_line_and_query(&lines[0])?;
    let headers = parse_headers(lines[1..].iter().map(|s| s.as_str()));

    let te = headers
        .get("transfer-encoding")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let body = if te.contains("chunked") {
        read_chunked_body(reader, max_body).await?
    } else {
        let content_len: usize = match headers.get("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| RequestError::Malformed(format!("bad content-length {v:?}")))?,
            None => 0,
        };
        if content_len > max_body {
            return Err(RequestError::BodyTooLarge);
        }
        let mut body = vec![0u8; content_len];
        reader.read_exact(&mut body).await?;
        body
    };

    let mut files = Vec::new();
    let ctype = headers
        .get("content-type")
        .map(|s| s.to_string())
        .unwrap_or_default();
    let ctype_lc = ctype.to_ascii_lowercase();
    if ctype_lc.starts_with("multipart/form-data") {
        let boundary = multipart::boundary_from_content_type(&ctype)
            .ok_or_else(|| RequestError::Malformed("multipart body without boundary".into()))?;
        for part in multipart::parse_multipart(&body, &boundary).map_err(RequestError::Malformed)? {
            match part.filename {
                Some(filename) => files.push(UploadedFile {
                    field: part.name,
                    filename: Some(filename),
                    body: part.data,
                }),
                None => args.push((part.name, String::from_utf8_lossy(&part.data).into_owned())),
            }
        }
    } else if !body.is_empty()
        && (ctype_lc.is_empty() || ctype_lc.starts_with("application/x-www-form-urlencoded"))
    {
        args.extend(parse_form_urlencoded(&String::from_utf8_lossy(&body)));
    }

    Ok(HttpRequest {
        method,
        path,
        headers,
        args,
        files,
    })
}

async fn read_chunked_body<R>(reader: &mut R, max_body: usize) -> Result<Vec<u8>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(RequestError::Malformed("unterminated chunked body".into()));
        }
        let ln = line.trim();
        if ln.is_empty() {
            continue;
        }
        // Chunk size is hex; extensions after ';' are ignored
        let size_hex = ln.split(';').next().unwrap_or(ln).trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| RequestError::Malformed(format!("bad chunk size {size_hex:?}")))?;
        if size == 0 {
            // Consume trailers until blank line or EOF
            loop {
                let mut tr = String::new();
                if reader.read_line(&mut tr).await? == 0 || tr.trim().is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if body.len().saturating_add(size) > max_body {
            return Err(RequestError::BodyTooLarge);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = String::new();
        reader.read_line(&mut crlf).await?;
    }
}

fn parse_headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> HeaderMap {
    let mut map = HeaderMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            map.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    map
}

fn parse_request_line_and_query(
    request_line: &str,
) -> Result<(Method, String, Vec<(String, String)>), RequestError> {
    let mut parts = request_line.split_whitespace();
    let method = match parts.next().unwrap_or("").to_ascii_uppercase().as_str() {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "" => return Err(RequestError::Malformed("empty request line".into())),
        other => Method::Other(other.to_string()),
    };
    let target = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing request target".into()))?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, parse_form_urlencoded(q)),
        None => (target, Vec::new()),
    };
    Ok((method, percent_decode(path), query))
}

/*
Unified application/x-www-form-urlencoded parser with decoding:
- '+' → space
- %XX → byte decode; invalid UTF-8 is replaced (lossy)
*/
pub fn parse_form_urlencoded(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let k = it.next().unwrap_or_default();
        let v = it.next().unwrap_or_default();
        out.push((form_decode(k), form_decode(v)));
    }
    out
}

fn form_decode(s: &str) -> String {
    percent_decode(&s.replace('+', " "))
}

fn percent_decode(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}

/// Response assembled by a handler; written to the socket exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn plain(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Response::new(200)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Replace any existing header of the same name (case-insensitive).
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize status line, headers (with Content-Length and Connection: close) and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (k, v) in &self.headers {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_bytes()).await?;
        w.flush().await
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
