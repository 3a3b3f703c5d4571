//! Method handlers: filesystem GET/HEAD, upload-store POST/PUT, and DELETE.

use std::cmp::min;
use std::fs;
use std::path::Path;

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::http;
use crate::response::{self, build_response, error_reply};
use crate::router;

/// GET and HEAD. A directory tries its index file, then autoindex, then 404.
/// HEAD keeps the Content-Length of the file it would have served.
pub fn get(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    path: &str,
    head_only: bool,
) {
    let location = router::find_location(config, path);
    let autoindex = location
        .and_then(|l| l.autoindex)
        .unwrap_or(config.autoindex);
    let index_file = location
        .and_then(|l| l.index.clone())
        .unwrap_or_else(|| config.index.clone());
    let full_path = router::file_path(path, config, location);

    match fs::metadata(&full_path) {
        Ok(metadata) if metadata.is_dir() => {
            let mut index_path = full_path.clone();
            if !index_path.ends_with('/') {
                index_path.push('/');
            }
            index_path.push_str(&index_file);
            if fs::metadata(&index_path)
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                serve_file(config, now, conn, &index_path, head_only);
            } else if !head_only && autoindex {
                match response::directory_listing(path, Path::new(&full_path)) {
                    Ok(html) => {
                        let reply = build_response(
                            now,
                            200,
                            "text/html",
                            html.as_bytes(),
                            None,
                            conn.conn_close,
                            false,
                        );
                        conn.finish(200, reply);
                    }
                    Err(e) => {
                        let reason = format!("Couldn't list directory: {}.", e);
                        conn.finish(500, error_reply(config, now, 500, &reason));
                    }
                }
            } else {
                let reply = error_reply(config, now, 404, "The URL you requested was not found.");
                conn.finish(404, reply);
            }
        }
        _ => serve_file(config, now, conn, &full_path, head_only),
    }
}

fn serve_file(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    fs_path: &str,
    head_only: bool,
) {
    match fs::read(fs_path) {
        Ok(bytes) => {
            let content_type = response::content_type_for(fs_path);
            let reply = build_response(
                now,
                200,
                content_type,
                &bytes,
                None,
                conn.conn_close,
                head_only,
            );
            conn.finish(200, reply);
        }
        Err(e) => {
            let (code, reason) = match e.kind() {
                std::io::ErrorKind::NotFound => {
                    (404, "The URL you requested was not found.".to_string())
                }
                std::io::ErrorKind::PermissionDenied => (
                    403,
                    "You don't have permission to access this URL.".to_string(),
                ),
                _ => (
                    500,
                    format!("The URL you requested cannot be returned: {}.", e),
                ),
            };
            conn.finish(code, error_reply(config, now, code, &reason));
        }
    }
}

/// POST: file upload into the location's upload_store, or 403 without one.
pub fn post(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    path: &str,
    headers: &str,
) {
    let location = router::find_location(config, path);
    let upload_dir = match location.and_then(|l| l.upload_store.clone()) {
        Some(dir) => dir,
        None => {
            let reply = error_reply(config, now, 403, "Uploads are not allowed for this location.");
            conn.finish(403, reply);
            return;
        }
    };

    let content_length = match conn.content_length {
        Some(length) => length as usize,
        None => {
            let reply = error_reply(config, now, 411, "Uploads require a Content-Length header.");
            conn.finish(411, reply);
            return;
        }
    };

    match fs::metadata(&upload_dir) {
        Ok(metadata) if metadata.is_dir() => {}
        _ => {
            let reply = error_reply(config, now, 404, "The upload directory does not exist.");
            conn.finish(404, reply);
            return;
        }
    }

    let body_start = conn.header_end;
    let take = min(content_length, conn.request.len() - body_start);
    let raw_body = &conn.request[body_start..body_start + take];

    let (content, extracted_name) = extract_multipart(raw_body, headers);
    let filename = match extracted_name {
        Some(name) => sanitize_filename(&name, now),
        None => fallback_filename(headers, path, now),
    };
    let filename = unique_filename(&upload_dir, &filename, now);
    let full_path = join_dir(&upload_dir, &filename);

    if fs::write(&full_path, &content).is_err() {
        let reply = error_reply(config, now, 500, "Failed to save uploaded file.");
        conn.finish(500, reply);
        return;
    }

    let body = format!(
        "<html><body><h1>Upload Successful</h1>\
        <p>File uploaded: {}</p>\
        <p>Size: {} bytes</p></body></html>",
        filename,
        content.len()
    );
    let reply = build_response(now, 201, "text/html", body.as_bytes(), None, conn.conn_close, false);
    conn.finish(201, reply);
}

/// PUT: write the body under the trailing segment's name in the upload_store.
/// 201 when created, 204 when overwriting.
pub fn put(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    path: &str,
    _headers: &str,
) {
    let location = router::find_location(config, path);
    let upload_dir = match location.and_then(|l| l.upload_store.clone()) {
        Some(dir) => dir,
        None => {
            let reply = error_reply(config, now, 403, "PUT is not allowed for this location.");
            conn.finish(403, reply);
            return;
        }
    };

    let segment = path.rsplit('/').next().unwrap_or("");
    if segment.is_empty() {
        let reply = error_reply(config, now, 400, "PUT requires a target filename.");
        conn.finish(400, reply);
        return;
    }
    let filename = sanitize_filename(segment, now);
    let full_path = join_dir(&upload_dir, &filename);

    let body_start = conn.header_end;
    let body: Vec<u8> = if conn.chunked {
        http::decode_chunked(&conn.request[body_start..])
    } else {
        let length = conn.content_length.unwrap_or(0) as usize;
        let take = min(length, conn.request.len() - body_start);
        conn.request[body_start..body_start + take].to_vec()
    };

    let existed = fs::metadata(&full_path).is_ok();
    if fs::write(&full_path, &body).is_err() {
        let reply = error_reply(config, now, 500, "Failed to save file.");
        conn.finish(500, reply);
        return;
    }

    if existed {
        let reply = build_response(now, 204, "text/html", b"", None, conn.conn_close, false);
        conn.finish(204, reply);
    } else {
        let body = format!(
            "<html><body><h1>Created</h1><p>File created: {}</p></body></html>",
            filename
        );
        let reply = build_response(now, 201, "text/html", body.as_bytes(), None, conn.conn_close, false);
        conn.finish(201, reply);
    }
}

/// DELETE: unlink a regular file resolved the same way GET resolves it.
pub fn delete(config: &ServerConfig, now: libc::time_t, conn: &mut Connection, path: &str) {
    let location = router::find_location(config, path);
    let full_path = router::file_path(path, config, location);

    let metadata = match fs::metadata(&full_path) {
        Ok(metadata) => metadata,
        Err(_) => {
            let reply = error_reply(config, now, 404, "The URL you requested was not found.");
            conn.finish(404, reply);
            return;
        }
    };
    if !metadata.is_file() {
        let reply = error_reply(config, now, 405, "Only regular files can be deleted.");
        conn.finish(405, reply);
        return;
    }
    if fs::remove_file(&full_path).is_err() {
        let reply = error_reply(config, now, 500, "Failed to delete file.");
        conn.finish(500, reply);
        return;
    }

    let body = format!(
        "<html><body><h1>Delete Successful</h1><p>File deleted: {}</p></body></html>",
        path
    );
    let reply = build_response(now, 200, "text/html", body.as_bytes(), None, conn.conn_close, false);
    conn.finish(200, reply);
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// First part of a multipart/form-data body: (content, filename). Anything
/// that doesn't parse falls back to the raw body.
fn extract_multipart(body: &[u8], headers: &str) -> (Vec<u8>, Option<String>) {
    let boundary = match http::multipart_boundary(headers) {
        Some(boundary) => boundary,
        None => return (body.to_vec(), None),
    };
    let delimiter = format!("--{}", boundary).into_bytes();

    let part_start = match http::find(&delimiter, body) {
        Some(at) => at,
        None => return (body.to_vec(), None),
    };
    let headers_start = match http::find(b"\r\n", &body[part_start..]) {
        Some(at) => part_start + at + 2,
        None => return (body.to_vec(), None),
    };
    let headers_end = match http::find(b"\r\n\r\n", &body[headers_start..]) {
        Some(at) => headers_start + at,
        None => return (body.to_vec(), None),
    };
    let part_headers = String::from_utf8_lossy(&body[headers_start..headers_end]);

    let filename = part_headers.find("filename=").map(|at| {
        let mut value = &part_headers[at + "filename=".len()..];
        if value.starts_with('"') {
            value = &value[1..];
        }
        let end = value
            .find(|c| matches!(c, '"' | '\r' | '\n'))
            .unwrap_or(value.len());
        value[..end].to_string()
    });

    let content_start = headers_end + 4;
    let mut content_end = match http::find(&delimiter, &body[content_start..]) {
        Some(at) => content_start + at,
        None => return (body.to_vec(), None),
    };
    if content_end >= 2 && &body[content_end - 2..content_end] == b"\r\n" {
        content_end -= 2;
    }
    (body[content_start..content_end].to_vec(), filename)
}

/// Strip any path component, keep only [A-Za-z0-9._-], drop leading dots.
/// A name emptied by sanitizing becomes upload_<unix-time>.bin.
fn sanitize_filename(filename: &str, now: libc::time_t) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    let mut result: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    while result.starts_with('.') {
        result.remove(0);
    }
    if result.is_empty() {
        result = format!("upload_{}.bin", now);
    }
    result
}

/// Upload name when multipart offered none: keep the request path's
/// extension, or .bin.
fn fallback_filename(headers: &str, path: &str, now: libc::time_t) -> String {
    if let Some(disposition) = http::header_value(headers, "Content-Disposition") {
        if let Some(at) = disposition.find("filename=") {
            let mut value = &disposition[at + "filename=".len()..];
            if value.starts_with('"') {
                value = &value[1..];
            }
            let end = value.find('"').unwrap_or(value.len());
            return sanitize_filename(&value[..end], now);
        }
    }
    let segment = path.rsplit('/').next().unwrap_or(path);
    let extension = match segment.rfind('.') {
        Some(dot) if dot > 0 => &segment[dot..],
        _ => ".bin",
    };
    format!("upload_{}{}", now, extension)
}

/// Append _N before the extension until the name is free.
fn unique_filename(dir: &str, filename: &str, now: libc::time_t) -> String {
    if fs::metadata(join_dir(dir, filename)).is_err() {
        return filename.to_string();
    }
    let (base, extension) = match filename.rfind('.') {
        Some(dot) if dot > 0 => filename.split_at(dot),
        _ => (filename, ""),
    };
    for counter in 1..10000 {
        let candidate = format!("{}_{}{}", base, counter, extension);
        if fs::metadata(join_dir(dir, &candidate)).is_err() {
            return candidate;
        }
    }
    format!("{}_{}{}", base, now, extension)
}
