//! Byte-level helpers over the raw request: header lookup, body framing,
//! chunked transfer decoding, and the keep-alive decision.

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split the request line into (method, target, version). Missing tokens come
/// back as empty strings; the router rejects those.
pub fn request_line(headers: &str) -> (String, String, String) {
    let first_line = headers.lines().next().unwrap_or("");
    let mut tokens = first_line.split_whitespace();
    let method = tokens.next().unwrap_or("").to_string();
    let target = tokens.next().unwrap_or("").to_string();
    let version = tokens.next().unwrap_or("").to_string();
    (method, target, version)
}

/// Look up a header value by name, case-insensitively. The match is anchored
/// to the start of a line; the returned value keeps its original case.
pub fn header_value(headers: &str, name: &str) -> Option<String> {
    let folded = headers.to_ascii_lowercase();
    let key = format!("{}:", name.to_ascii_lowercase());
    let mut from = 0;
    while let Some(pos) = folded[from..].find(&key) {
        let at = from + pos;
        if at == 0 || folded.as_bytes()[at - 1] == b'\n' {
            let value = &headers[at + key.len()..];
            let value = match value.find(|c| c == '\r' || c == '\n') {
                Some(end) => &value[..end],
                None => value,
            };
            return Some(value.trim().to_string());
        }
        from = at + key.len();
    }
    None
}

/// Declared `Content-Length`, or `None` when the header is absent.
/// An unparsable value reads as zero, matching a lenient atoi.
pub fn content_length(headers: &str) -> Option<u64> {
    header_value(headers, "Content-Length").map(|v| v.parse().unwrap_or(0))
}

/// True when `Transfer-Encoding` names the `chunked` coding.
pub fn is_chunked(headers: &str) -> bool {
    match header_value(headers, "Transfer-Encoding") {
        Some(value) => value.to_ascii_lowercase().contains("chunked"),
        None => false,
    }
}

/// True once the terminal zero-size chunk has arrived.
pub fn chunked_complete(body: &[u8]) -> bool {
    find(b"0\r\n\r\n", body).is_some()
}

/// Decode a chunked transfer coding into plain bytes. Trailing garbage and
/// truncated chunks end the decode rather than failing it.
pub fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let line_end = match find(b"\r\n", &raw[pos..]) {
            Some(end) => pos + end,
            None => break,
        };
        let size_line = &raw[pos..line_end];
        let size_line = match size_line.iter().position(|&b| b == b';') {
            Some(semicolon) => &size_line[..semicolon],
            None => size_line,
        };
        let size_str = std::str::from_utf8(size_line).unwrap_or("");
        let chunk_size = usize::from_str_radix(size_str.trim(), 16).unwrap_or(0);
        if chunk_size == 0 {
            break;
        }
        pos = line_end + 2;
        if pos + chunk_size > raw.len() {
            break;
        }
        decoded.extend_from_slice(&raw[pos..pos + chunk_size]);
        pos += chunk_size;
        if pos + 2 <= raw.len() {
            pos += 2;
        }
    }
    decoded
}

/// Extract the multipart boundary from a `Content-Type` header, if any.
pub fn multipart_boundary(headers: &str) -> Option<String> {
    let content_type = header_value(headers, "Content-Type")?;
    let folded = content_type.to_ascii_lowercase();
    let at = folded.find("boundary=")?;
    let mut value = &content_type[at + "boundary=".len()..];
    if value.starts_with('"') {
        value = &value[1..];
    }
    let end = value
        .find(|c| matches!(c, '"' | '\r' | '\n' | ';' | ' '))
        .unwrap_or(value.len());
    Some(value[..end].to_string())
}

/// Keep-alive decision: HTTP/1.1 stays open unless `Connection: close`,
/// HTTP/1.0 stays open only on `Connection: keep-alive`, anything else closes.
pub fn keep_alive(version: &str, headers: &str) -> bool {
    let connection = header_value(headers, "Connection").map(|v| v.to_ascii_lowercase());
    match version {
        "HTTP/1.1" => connection.as_deref() != Some("close"),
        "HTTP/1.0" => connection.as_deref() == Some("keep-alive"),
        _ => false,
    }
}
