//! Request routing: request-line validation, location matching, redirects,
//! method gating, the per-location body-size gate, and dispatch to the
//! method handlers or the CGI engine.

use crate::cgi;
use crate::config::{LocationConfig, ServerConfig};
use crate::conn::Connection;
use crate::handlers;
use crate::http;
use crate::response::{error_reply, make_safe_url, redirect_reply};

const KNOWN_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "DELETE"];

/// Longest path-aligned-prefix location match: the prefix only counts when it
/// ends at a path separator boundary.
pub fn find_location<'a>(config: &'a ServerConfig, path: &str) -> Option<&'a LocationConfig> {
    let mut best: Option<&LocationConfig> = None;
    let mut best_len = 0;
    for location in &config.locations {
        if !path.starts_with(&location.path) {
            continue;
        }
        let aligned = path.len() == location.path.len()
            || location.path.ends_with('/')
            || path.as_bytes().get(location.path.len()) == Some(&b'/');
        if aligned && location.path.len() > best_len {
            best_len = location.path.len();
            best = Some(location);
        }
    }
    best
}

/// The request path with the matched location prefix stripped; an emptied
/// path reads as "/". Location "/" (or none) leaves the path alone.
pub fn relative_path<'a>(path: &'a str, location: Option<&LocationConfig>) -> &'a str {
    let location = match location {
        Some(location) if !location.path.is_empty() && location.path != "/" => location,
        _ => return path,
    };
    match path.strip_prefix(location.path.as_str()) {
        Some("") => "/",
        Some(relative) => relative,
        None => path,
    }
}

/// Filesystem path for a request path: location root (or alias, or the
/// server root) plus the location-relative remainder.
pub fn file_path(path: &str, config: &ServerConfig, location: Option<&LocationConfig>) -> String {
    let root = location
        .and_then(|l| l.root.as_deref().or_else(|| l.alias.as_deref()))
        .unwrap_or(&config.root);
    format!("{}{}", root, relative_path(path, location))
}

/// Effective request-body cap for a target: the longest matching location's
/// explicit limit, or the server default. 0 means unlimited.
pub fn effective_body_cap(config: &ServerConfig, target: &str) -> u64 {
    let path = target.split('?').next().unwrap_or(target);
    match find_location(config, path) {
        Some(location) => location
            .client_max_body_size
            .unwrap_or(config.client_max_body_size),
        None => config.client_max_body_size,
    }
}

/// An empty allow_methods list leaves the location unrestricted.
fn method_allowed(location: &LocationConfig, method: &str) -> bool {
    location.allow_methods.is_empty() || location.allow_methods.iter().any(|m| m == method)
}

/// A location whose path equals the request-target exactly and that carries a
/// `return <code> <url>` directive.
fn find_redirect(config: &ServerConfig, target: &str) -> Option<(u16, String)> {
    for location in &config.locations {
        if location.path != target {
            continue;
        }
        if let Some(redirect) = &location.redirect {
            let mut tokens = redirect.split_whitespace();
            let code: u16 = tokens.next()?.parse().ok()?;
            let url = tokens.next()?.to_string();
            if code == 301 || code == 302 {
                return Some((code, url));
            }
        }
    }
    None
}

/// Route one complete request. On return the connection either carries a
/// finished response or has moved to CgiRunning with a live child.
pub fn handle_request(config: &ServerConfig, now: libc::time_t, conn: &mut Connection) {
    let header_len = conn.header_end.saturating_sub(4);
    let headers = String::from_utf8_lossy(&conn.request[..header_len]).into_owned();
    let (method, target, version) = http::request_line(&headers);

    conn.method = Some(method.clone());
    conn.url = Some(target.clone());
    conn.referer = http::header_value(&headers, "Referer");
    conn.user_agent = http::header_value(&headers, "User-Agent");
    conn.conn_close = !http::keep_alive(&version, &headers);

    if method.is_empty() || target.is_empty() || version.is_empty() || !version.starts_with("HTTP/")
    {
        let reply = error_reply(config, now, 400, "You sent a request that the server couldn't understand.");
        conn.finish(400, reply);
        return;
    }

    if version == "HTTP/1.1" && http::header_value(&headers, "Host").is_none() {
        let reply = error_reply(config, now, 400, "HTTP/1.1 requests must include a Host header.");
        conn.finish(400, reply);
        return;
    }

    if let Some((code, url)) = find_redirect(config, &target) {
        let reply = redirect_reply(now, code, &url, conn.conn_close);
        conn.finish(code, reply);
        return;
    }

    if !KNOWN_METHODS.contains(&method.as_str()) {
        let reply = error_reply(config, now, 501, "The method you specified is not implemented.");
        conn.finish(501, reply);
        return;
    }

    let raw_path = target.split('?').next().unwrap_or(&target);
    let path = match make_safe_url(raw_path) {
        Some(path) => path,
        None => {
            let reply = error_reply(config, now, 400, "You requested an invalid URL.");
            conn.finish(400, reply);
            return;
        }
    };

    if let Some(location) = find_location(config, &path) {
        if !method_allowed(location, &method) {
            let reply = error_reply(config, now, 405, "The method is not allowed for this location.");
            conn.finish(405, reply);
            return;
        }
    }

    if method == "POST" || method == "PUT" {
        let cap = effective_body_cap(config, &target);
        if cap > 0 {
            let actual = if conn.chunked {
                http::decode_chunked(&conn.request[conn.header_end..]).len() as u64
            } else {
                conn.content_length.unwrap_or(0)
            };
            if actual > cap {
                let reply = error_reply(config, now, 413, "The request body exceeds the configured limit.");
                conn.finish(413, reply);
                return;
            }
        }
    }

    if (method == "GET" || method == "POST")
        && cgi::try_handle(config, now, conn, &method, &target, &path, &headers)
    {
        return;
    }

    match method.as_str() {
        "GET" => handlers::get(config, now, conn, &path, false),
        "HEAD" => handlers::get(config, now, conn, &path, true),
        "POST" => handlers::post(config, now, conn, &path, &headers),
        "PUT" => handlers::put(config, now, conn, &path, &headers),
        "DELETE" => handlers::delete(config, now, conn, &path),
        _ => unreachable!("method gate admitted an unknown method"),
    }
}
