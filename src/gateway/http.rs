/*!
HTTP helpers for the gateway: tolerant request parsing, endpoint classification and
response writers.

A single HTTP/1.1 request is read from a Read stream, with compatibility for both
CRLFCRLF and LFLF header termination, a 16 KiB header cap and a 64 KiB body cap. Bodies
are taken from Content-Length or de-chunked when the client uses chunked transfer
encoding. Streamed responses use chunked encoding with trailers.
*/

use std::collections::HashMap;
use std::io::{self, Read, Write};

use serde::Serialize;

pub const HEADER_CAP: usize = 16 * 1024;
pub const BODY_CAP: usize = 64 * 1024;

/// Supported HTTP methods (minimal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other(String),
}

/// Gateway endpoints we recognize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Cli,
    Health,
}

/// Simple case-insensitive header map (keys lowercased)
pub type HeaderMap = HashMap<String, String>;

/// Parsed HTTP request (lowercased path, normalized headers)
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path_lc: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Locate the end of the header block (index just past the blank line).
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    // Also accept LF-only separators for robustness
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Parse a single HTTP request from a reader.
///
/// Errors:
/// - `InvalidInput` when the header block exceeds [`HEADER_CAP`]
/// - `InvalidData` for a malformed request line, bad chunk framing, a body larger than
///   [`BODY_CAP`] or a body shorter than its Content-Length
/// - `UnexpectedEof` when the peer closes before sending a full header block
pub fn read_http_request<R: Read>(reader: &mut R) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    // Read until we find the end of headers or hit the cap/EOF
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() >= HEADER_CAP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request headers too large",
            ));
        }
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of headers",
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    if header_end > HEADER_CAP {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "request headers too large",
        ));
    }

    let header_str = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default().trim().to_string();
    let (method, path_lc) = parse_request_line(&request_line)?;
    let headers = parse_headers(lines);

    // Bytes already read past the header block belong to the body.
    let mut pending: Vec<u8> = buf[header_end..].to_vec();

    let te = headers
        .get("transfer-encoding")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let body = if te.contains("chunked") {
        read_chunked_body(reader, &mut pending)?
    } else {
        let content_len: usize = match headers.get("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| invalid_data("invalid content-length"))?,
            None => 0,
        };
        if content_len > BODY_CAP {
            return Err(invalid_data("request body too large"));
        }
        while pending.len() < content_len {
            let n = reader.read(&mut tmp)?;
            if n == 0 {
                return Err(invalid_data("request body shorter than content-length"));
            }
            pending.extend_from_slice(&tmp[..n]);
        }
        pending.truncate(content_len);
        pending
    };

    Ok(HttpRequest {
        method,
        path_lc,
        headers,
        body,
    })
}

/// Read one line (CRLF or LF terminated) from `rbuf`, refilling it from `reader`.
fn read_line_from<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>) -> io::Result<String> {
    loop {
        if let Some(pos) = rbuf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = rbuf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map_err(|_| invalid_data("non-utf8 chunk line"));
        }
        if rbuf.len() > HEADER_CAP {
            return Err(invalid_data("chunk line too long"));
        }
        fill(reader, rbuf)?;
    }
}

fn fill<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>) -> io::Result<()> {
    let mut tmp = [0u8; 1024];
    let n = reader.read(&mut tmp)?;
    if n == 0 {
        return Err(invalid_data("unexpected end of chunked body"));
    }
    rbuf.extend_from_slice(&tmp[..n]);
    Ok(())
}

fn read_chunked_body<R: Read>(reader: &mut R, rbuf: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_line_from(reader, rbuf)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Parse chunk size (hex), tolerate extensions after ';'
        let size_hex = line.split(';').next().unwrap_or(line).trim();
        let size =
            usize::from_str_radix(size_hex, 16).map_err(|_| invalid_data("bad chunk size"))?;
        if size == 0 {
            // Consume trailers until blank line
            while !read_line_from(reader, rbuf)?.trim().is_empty() {}
            return Ok(body);
        }
        if body.len().saturating_add(size) > BODY_CAP {
            return Err(invalid_data("request body too large"));
        }
        while rbuf.len() < size + 1 {
            fill(reader, rbuf)?;
        }
        body.extend(rbuf.drain(..size));
        // Trailing CRLF (or LF) after chunk payload
        if rbuf.first() == Some(&b'\r') {
            while rbuf.len() < 2 {
                fill(reader, rbuf)?;
            }
            rbuf.drain(..2);
        } else if rbuf.first() == Some(&b'\n') {
            rbuf.drain(..1);
        } else {
            return Err(invalid_data("missing chunk terminator"));
        }
    }
}

/// Classify a lowercased path into a known endpoint.
pub fn classify_endpoint(path_lc: &str) -> Option<Endpoint> {
    match path_lc {
        "/api/cli" => Some(Endpoint::Cli),
        "/healthz" => Some(Endpoint::Health),
        _ => None,
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

fn parse_request_line(request_line: &str) -> io::Result<(Method, String)> {
    let mut parts = request_line.split_whitespace();
    let method = match parts.next() {
        Some(m) => match m.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        },
        None => return Err(invalid_data("empty request line")),
    };
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("missing request target"))?;
    let path_only = target
        .split('?')
        .next()
        .unwrap_or(target)
        .trim_end_matches('/')
        .to_ascii_lowercase();
    let path_only = if path_only.is_empty() {
        "/".to_string()
    } else {
        path_only
    };
    Ok((method, path_only))
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Serialize `{"error": msg}`.
pub fn error_body(msg: &str) -> Vec<u8> {
    serde_json::to_vec(&ErrorBody { error: msg })
        .unwrap_or_else(|_| br#"{"error":"Internal server error"}"#.to_vec())
}

/// Write a complete JSON response with Content-Length and close semantics.
pub fn respond_json<W: Write>(
    w: &mut W,
    status: &str,
    request_id: Option<&str>,
    body: &[u8],
) -> io::Result<()> {
    let mut header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(id) = request_id {
        header.push_str(&format!("X-Request-Id: {id}\r\n"));
    }
    header.push_str("\r\n");
    w.write_all(header.as_bytes())?;
    w.write_all(body)?;
    w.flush()
}

pub fn respond_json_error<W: Write>(
    w: &mut W,
    status: &str,
    request_id: Option<&str>,
    msg: &str,
) -> io::Result<()> {
    respond_json(w, status, request_id, &error_body(msg))
}

/// Status line and headers of a streamed text response.
pub fn respond_chunked_prelude<W: Write>(w: &mut W, request_id: &str) -> io::Result<()> {
    let hdr = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nTransfer-Encoding: chunked\r\nTrailer: X-Exit-Code, X-Error\r\nCache-Control: no-cache\r\nX-Request-Id: {request_id}\r\nConnection: close\r\n\r\n"
    );
    w.write_all(hdr.as_bytes())?;
    w.flush()
}

pub fn respond_chunked_write_chunk<W: Write>(w: &mut W, chunk: &[u8]) -> io::Result<()> {
    if !chunk.is_empty() {
        write!(w, "{:X}\r\n", chunk.len())?;
        w.write_all(chunk)?;
        w.write_all(b"\r\n")?;
        w.flush()?;
    }
    Ok(())
}

/// Last chunk plus trailers. `error` adds an `X-Error` trailer.
pub fn respond_chunked_trailer<W: Write>(
    w: &mut W,
    code: i32,
    error: Option<&str>,
) -> io::Result<()> {
    w.write_all(b"0\r\n")?;
    let mut trailer = format!("X-Exit-Code: {code}\r\n");
    if let Some(msg) = error {
        // Trailer values must stay on one line.
        let one_line: String = msg.chars().filter(|c| !c.is_control()).collect();
        trailer.push_str(&format!("X-Error: {one_line}\r\n"));
    }
    trailer.push_str("\r\n");
    w.write_all(trailer.as_bytes())?;
    w.flush()
}
