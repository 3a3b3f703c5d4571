use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{Local, TimeZone, Utc};
use once_cell::sync::Lazy;

use crate::config::ServerConfig;

/// Reason phrase for every status code the server can emit or a CGI script
/// can ask for.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub libc::time_t);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Utc.timestamp(self.0 as i64, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub libc::time_t);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Local.timestamp(self.0 as i64, 0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or
/// double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

/// Resolve //, /./, and /../ in a URL path.
///
/// Returns None if the path is invalid/unsafe.
pub fn make_safe_url(url: &str) -> Option<String> {
    let mut url = url.as_bytes().to_vec();

    // Paths not starting with a slash are illegal.
    if !url.starts_with(&[b'/']) {
        return None;
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < url.len() {
        if url[src_index] == b'/' && url.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && matches!(url.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && url.get(src_index + 2) == Some(&b'.')
            && matches!(url.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return None;
                }
                dst_index -= 1;
                if url[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            url[dst_index] = url[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve leading slash
    dst_index = std::cmp::max(dst_index, 1);
    url.truncate(dst_index);

    String::from_utf8(url).ok()
}

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/mp4               mp4",
];

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Create MimeMap using the default extension map.
    fn parse_default_extension_map() -> MimeMap {
        let mut mime_map = MimeMap {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }

    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a URL or filesystem path.
    pub fn url_content_type(&self, url: &str) -> &str {
        url.rsplit('.')
            .next()
            .and_then(|extension| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

static MIME_MAP: Lazy<MimeMap> = Lazy::new(MimeMap::parse_default_extension_map);

pub fn content_type_for(path: &str) -> &'static str {
    MIME_MAP.url_content_type(path)
}

/// Assemble a complete response. `Content-Length` is always emitted except
/// for 204, and the body is withheld for HEAD while the headers still
/// describe it.
pub fn build_response(
    now: libc::time_t,
    code: u16,
    content_type: &str,
    body: &[u8],
    location: Option<&str>,
    conn_close: bool,
    head_only: bool,
) -> Vec<u8> {
    let mut header = format!(
        "HTTP/1.1 {} {}\r\n\
        Date: {}\r\n\
        Server: {}/{}\r\n",
        code,
        status_text(code),
        HttpDate(now),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    if let Some(location) = location {
        header.push_str(&format!("Location: {}\r\n", location));
    }
    header.push_str(if conn_close {
        "Connection: close\r\n"
    } else {
        "Connection: keep-alive\r\n"
    });
    if code != 204 {
        header.push_str(&format!("Content-Length: {}\r\n", body.len()));
        header.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    header.push_str("\r\n");

    let mut response = header.into_bytes();
    if !head_only && code != 204 {
        response.extend_from_slice(body);
    }
    response
}

/// Read the configured error page for `code`, relative to the server root.
fn load_error_page(config: &ServerConfig, code: u16) -> Option<String> {
    let page = config.error_pages.get(&code)?;
    let path = if page.starts_with('/') {
        format!("{}{}", config.root, page)
    } else {
        format!("{}/{}", config.root, page)
    };
    fs::read_to_string(path).ok()
}

/// A default reply for any erroneous occasion. Uses the configured error page
/// when one exists and loads, otherwise a generated body.
pub fn error_reply(config: &ServerConfig, now: libc::time_t, code: u16, reason: &str) -> Vec<u8> {
    let body = load_error_page(config, code).unwrap_or_else(|| {
        format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            <hr>\n\
            </body></html>\n",
            code,
            status_text(code),
            status_text(code),
            HtmlEscaped(reason),
        )
    });
    build_response(now, code, "text/html", body.as_bytes(), None, true, false)
}

/// A redirect reply.
pub fn redirect_reply(
    now: libc::time_t,
    code: u16,
    location: &str,
    conn_close: bool,
) -> Vec<u8> {
    let body = format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        Moved to: <a href=\"{}\">{}</a>\n\
        <hr>\n\
        </body></html>\n",
        code,
        status_text(code),
        status_text(code),
        location,
        location,
    );
    build_response(
        now,
        code,
        "text/html",
        body.as_bytes(),
        Some(location),
        conn_close,
        false,
    )
}

/// Directory listing body: sorted subdirectories first, then files, with
/// hrefs rooted at the request path.
struct Listing<'a> {
    url_path: &'a str,
    directories: Vec<String>,
    files: Vec<(String, u64)>,
}

impl<'a> std::fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<a href=\"..\">..</a>/\n")?;
        for name in &self.directories {
            write!(
                f,
                "<a href=\"{}{}/\">{}</a>/\n",
                self.url_path,
                UrlEncoded(name),
                HtmlEscaped(name)
            )?;
        }
        for (name, size) in &self.files {
            write!(
                f,
                "<a href=\"{}{}\">{}</a> {}\n",
                self.url_path,
                UrlEncoded(name),
                HtmlEscaped(name),
                size
            )?;
        }
        Ok(())
    }
}

/// Generate an HTML listing of `dir` for the request path `url_path`.
pub fn directory_listing(url_path: &str, dir: &Path) -> std::io::Result<String> {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.metadata() {
            Ok(metadata) if metadata.is_dir() => directories.push(name),
            Ok(metadata) => files.push((name, metadata.len())),
            Err(_) => continue,
        }
    }
    directories.sort();
    files.sort();

    let mut url_path = url_path.to_string();
    if !url_path.ends_with('/') {
        url_path.push('/');
    }
    let listing = Listing {
        url_path: &url_path,
        directories,
        files,
    };
    Ok(format!(
        "<html>\n<head>\n<title>{}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
        {}\
        </pre></tt>\n\
        <hr>\n\
        </body>\n</html>\n",
        HtmlEscaped(&url_path),
        HtmlEscaped(&url_path),
        listing,
    ))
}
