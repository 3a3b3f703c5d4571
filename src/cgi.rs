//! CGI/1.1 execution: child spawning with pipe redirection, non-blocking
//! I/O against the child, response assembly from its output, and
//! timeout-driven termination.

use std::cmp::min;
use std::ffi::{CStr, CString};
use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, chdir, close, dup2, execve, fork, pipe, read, write, AccessFlags, ForkResult};

use crate::config::{LocationConfig, ServerConfig};
use crate::conn::{ConnState, Connection};
use crate::http;
use crate::response::{error_reply, status_text};
use crate::router;
use crate::server::{set_cloexec, set_nonblocking};

pub const CGI_TIMEOUT_SECS: libc::time_t = 30;
const PIPE_CHUNK: usize = 65536;

/// Outcome of one non-blocking pipe operation.
pub enum PipeProgress {
    /// Would block; stay armed.
    Again,
    /// Moved some bytes; more to come.
    Advanced,
    /// This direction is finished (body drained or EOF).
    Done,
    /// Hard error on the pipe.
    Failed,
}

/// The `.ext` token in `path` that matches one of the location's cgi_ext
/// entries. The extension ends at the next `/` or `?`.
pub fn cgi_extension(path: &str, location: &LocationConfig) -> Option<String> {
    if location.cgi_ext.is_empty() {
        return None;
    }
    let dot = path.rfind('.')?;
    let rest = &path[dot..];
    let end = rest
        .find(|c| c == '/' || c == '?')
        .unwrap_or(rest.len());
    let extension = &rest[..end];
    location
        .cgi_ext
        .iter()
        .find(|e| e.as_str() == extension)
        .map(|e| e.clone())
}

/// Interpreter for a matched extension; cgi_path runs parallel to cgi_ext
/// and its last entry is reused when cgi_ext is longer.
pub fn find_interpreter(extension: &str, location: &LocationConfig) -> Option<String> {
    if location.cgi_path.is_empty() {
        return None;
    }
    let index = location.cgi_ext.iter().position(|e| e == extension)?;
    Some(
        location
            .cgi_path
            .get(index)
            .unwrap_or_else(|| location.cgi_path.last().unwrap())
            .clone(),
    )
}

/// The request-path prefix naming the script itself: everything up to the
/// first `/` after the extension, or the whole path.
pub fn script_url_prefix(path: &str) -> String {
    match path.rfind('.') {
        Some(dot) => match path[dot..].find('/') {
            Some(slash) => path[..dot + slash].to_string(),
            None => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// The trailing portion after the script: PATH_INFO, possibly empty.
pub fn extract_path_info(path: &str) -> String {
    match path.rfind('.') {
        Some(dot) => match path[dot..].find('/') {
            Some(slash) => path[dot + slash..].to_string(),
            None => String::new(),
        },
        None => String::new(),
    }
}

fn script_directory(script_path: &str) -> &str {
    match script_path.rfind('/') {
        Some(slash) => &script_path[..slash],
        None => ".",
    }
}

fn script_basename(script_path: &str) -> &str {
    match script_path.rfind('/') {
        Some(slash) => &script_path[slash + 1..],
        None => script_path,
    }
}

/// HTTP_<UPPER_CANONICAL> environment name for a request header.
fn header_env_name(name: &str) -> String {
    let mut env_name = String::from("HTTP_");
    for c in name.chars() {
        if c == '-' {
            env_name.push('_');
        } else {
            env_name.push(c.to_ascii_uppercase());
        }
    }
    env_name
}

/// A binary that reads its script from the environment rather than argv.
fn is_standalone_cgi(interpreter: &str) -> bool {
    !(interpreter.contains("php")
        || interpreter.contains("python")
        || interpreter.contains("perl")
        || interpreter.contains("ruby"))
}

/// CGI/1.1 environment plus the common extensions.
fn build_environment(
    config: &ServerConfig,
    method: &str,
    script_name: &str,
    script_filename: &str,
    path_info: &str,
    query_string: &str,
    headers: &str,
    body_len: usize,
) -> Vec<CString> {
    let mut vars: Vec<String> = vec![
        "GATEWAY_INTERFACE=CGI/1.1".to_string(),
        "SERVER_PROTOCOL=HTTP/1.1".to_string(),
        format!(
            "SERVER_SOFTWARE={}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        format!("SERVER_NAME={}", config.host),
        format!("SERVER_PORT={}", config.port),
        format!("DOCUMENT_ROOT={}", config.root),
        format!("REQUEST_METHOD={}", method),
        format!("SCRIPT_NAME={}", script_name),
        format!("SCRIPT_FILENAME={}", script_filename),
    ];

    // Standalone testers read the request URI out of PATH_INFO, so it falls
    // back to the script name rather than staying empty.
    if path_info.is_empty() {
        vars.push(format!("PATH_INFO={}", script_name));
    } else {
        vars.push(format!("PATH_INFO={}", path_info));
        vars.push(format!("PATH_TRANSLATED={}{}", config.root, path_info));
    }
    vars.push(format!("QUERY_STRING={}", query_string));

    let mut request_uri = format!("{}{}", script_name, path_info);
    if !query_string.is_empty() {
        request_uri.push('?');
        request_uri.push_str(query_string);
    }
    vars.push(format!("REQUEST_URI={}", request_uri));

    if body_len > 0 {
        vars.push(format!("CONTENT_LENGTH={}", body_len));
    }
    if let Some(content_type) = http::header_value(headers, "Content-Type") {
        vars.push(format!("CONTENT_TYPE={}", content_type));
    }
    vars.push("REMOTE_ADDR=127.0.0.1".to_string());
    vars.push("REMOTE_HOST=localhost".to_string());
    vars.push("REDIRECT_STATUS=200".to_string());

    for line in headers.lines().skip(1) {
        let line = line.trim_end_matches('\r');
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim();
        let folded = name.to_ascii_lowercase();
        if folded == "content-type" || folded == "content-length" {
            continue;
        }
        vars.push(format!("{}={}", header_env_name(name), value));
    }

    vars.into_iter()
        .filter_map(|v| CString::new(v).ok())
        .collect()
}

/// Attempt CGI dispatch for a routed request. Returns false when the target
/// is not a CGI script for this location; true when the request was consumed
/// (child running, or an error response recorded).
pub fn try_handle(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    method: &str,
    target: &str,
    path: &str,
    headers: &str,
) -> bool {
    let location = match router::find_location(config, path) {
        Some(location) => location,
        None => return false,
    };
    let extension = match cgi_extension(path, location) {
        Some(extension) => extension,
        None => return false,
    };

    // Filesystem path of the script itself, PATH_INFO stripped.
    let mut script_path = router::file_path(path, config, Some(location));
    if let Some(at) = script_path.find(&extension) {
        let after = at + extension.len();
        if script_path.as_bytes().get(after) == Some(&b'/') {
            script_path.truncate(after);
        }
    }
    if fs::metadata(&script_path).is_err() {
        let reply = error_reply(config, now, 404, "The CGI script was not found.");
        conn.finish(404, reply);
        return true;
    }

    let body: Vec<u8> = if method == "POST" {
        let body_start = conn.header_end;
        if conn.chunked {
            http::decode_chunked(&conn.request[body_start..])
        } else {
            let length = conn.content_length.unwrap_or(0) as usize;
            let take = min(length, conn.request.len() - body_start);
            conn.request[body_start..body_start + take].to_vec()
        }
    } else {
        Vec::new()
    };

    if let Err(e) = spawn(
        config,
        now,
        conn,
        method,
        target,
        path,
        headers,
        body,
        &extension,
        location,
        &script_path,
    ) {
        eprintln!("warning: CGI execution failed: {:#}", e);
        let reply = error_reply(config, now, 500, "CGI execution failed.");
        conn.finish(500, reply);
    }
    true
}

/// Create the pipes, fork, and exec the interpreter. On success the
/// connection is in CgiRunning and owns both retained pipe ends; on error
/// every fd created here has been closed again.
#[allow(clippy::too_many_arguments)]
fn spawn(
    config: &ServerConfig,
    now: libc::time_t,
    conn: &mut Connection,
    method: &str,
    target: &str,
    path: &str,
    headers: &str,
    body: Vec<u8>,
    extension: &str,
    location: &LocationConfig,
    script_path: &str,
) -> Result<()> {
    // A child left over from an earlier request on this connection must not
    // be forgotten when its pid slot is reused.
    if conn.cgi_pid.is_some() {
        kill_child(conn);
    }

    let interpreter = find_interpreter(extension, location)
        .ok_or_else(|| anyhow!("no interpreter configured for {}", extension))?;
    let interpreter = fs::canonicalize(&interpreter)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(interpreter);
    access(interpreter.as_str(), AccessFlags::X_OK)
        .with_context(|| format!("interpreter {} is not executable", interpreter))?;

    let script_filename = fs::canonicalize(script_path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| script_path.to_string());

    let query_string = match target.find('?') {
        Some(at) => &target[at + 1..],
        None => "",
    };
    let path_info = extract_path_info(path);
    conn.cgi_script_name = script_url_prefix(path);

    let env = build_environment(
        config,
        method,
        &conn.cgi_script_name,
        &script_filename,
        &path_info,
        query_string,
        headers,
        body.len(),
    );

    // Everything the child needs is prepared before fork; the child only
    // calls async-signal-safe functions plus execve.
    let interpreter_c = CString::new(interpreter.clone()).context("interpreter path contains NUL")?;
    let mut argv: Vec<CString> = vec![interpreter_c.clone()];
    if !is_standalone_cgi(&interpreter) {
        argv.push(CString::new(script_basename(script_path)).context("script name contains NUL")?);
    }
    let script_dir = script_directory(script_path).to_string();

    let (stdin_read, stdin_write) = pipe().context("failed to create stdin pipe")?;
    let (stdout_read, stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            return Err(e).context("failed to create stdout pipe");
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            if dup2(stdin_read, libc::STDIN_FILENO).is_err()
                || dup2(stdout_write, libc::STDOUT_FILENO).is_err()
            {
                unsafe { libc::_exit(1) };
            }
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            chdir(script_dir.as_str()).ok();
            let argv_refs: Vec<&CStr> = argv.iter().map(|a| a.as_c_str()).collect();
            let env_refs: Vec<&CStr> = env.iter().map(|e| e.as_c_str()).collect();
            execve(&interpreter_c, &argv_refs, &env_refs).ok();
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => {
            close(stdin_read).ok();
            close(stdout_write).ok();
            // Non-blocking for the loop; close-on-exec so children forked
            // for other connections don't hold these ends open.
            if set_nonblocking(stdin_write).is_err()
                || set_nonblocking(stdout_read).is_err()
                || set_cloexec(stdin_write).is_err()
                || set_cloexec(stdout_read).is_err()
            {
                close(stdin_write).ok();
                close(stdout_read).ok();
                kill(child, Signal::SIGKILL).ok();
                waitpid(child, Some(WaitPidFlag::WNOHANG)).ok();
                bail!("failed to set CGI pipes non-blocking");
            }
            conn.cgi_pid = Some(child);
            conn.cgi_input_fd = Some(stdin_write);
            conn.cgi_output_fd = Some(stdout_read);
            conn.cgi_body = body;
            conn.cgi_body_offset = 0;
            conn.cgi_output = Vec::new();
            conn.cgi_start = now;
            conn.state = ConnState::CgiRunning;
            Ok(())
        }
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            Err(e).context("fork failed")
        }
    }
}

/// Push pending request body into the child's stdin.
pub fn write_body(conn: &mut Connection) -> PipeProgress {
    let fd = match conn.cgi_input_fd {
        Some(fd) => fd,
        None => return PipeProgress::Done,
    };
    if conn.cgi_body_offset >= conn.cgi_body.len() {
        return PipeProgress::Done;
    }
    let end = min(conn.cgi_body_offset + PIPE_CHUNK, conn.cgi_body.len());
    match write(fd, &conn.cgi_body[conn.cgi_body_offset..end]) {
        Ok(0) => PipeProgress::Done,
        Ok(written) => {
            conn.cgi_body_offset += written;
            if conn.cgi_body_offset >= conn.cgi_body.len() {
                PipeProgress::Done
            } else {
                PipeProgress::Advanced
            }
        }
        Err(e) if e.as_errno() == Some(Errno::EAGAIN) => PipeProgress::Again,
        Err(_) => PipeProgress::Failed,
    }
}

/// Drain the child's stdout into the accumulator.
pub fn read_output(conn: &mut Connection) -> PipeProgress {
    let fd = match conn.cgi_output_fd {
        Some(fd) => fd,
        None => return PipeProgress::Done,
    };
    let mut buf = [0u8; PIPE_CHUNK];
    match read(fd, &mut buf) {
        Ok(0) => PipeProgress::Done,
        Ok(received) => {
            conn.cgi_output.extend_from_slice(&buf[..received]);
            PipeProgress::Advanced
        }
        Err(e) if e.as_errno() == Some(Errno::EAGAIN) => PipeProgress::Again,
        Err(_) => PipeProgress::Failed,
    }
}

/// Try to collect the child without blocking. A child still winding down
/// after closing stdout stays recorded and is collected on a later attempt;
/// only the timeout scan kills a running child.
pub fn reap(conn: &mut Connection) {
    let pid = match conn.cgi_pid {
        Some(pid) => pid,
        None => return,
    };
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => {
            if code != 0 {
                eprintln!("warning: CGI process exited with code {}", code);
            }
            conn.cgi_pid = None;
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            eprintln!("warning: CGI process killed by signal {}", signal);
            conn.cgi_pid = None;
        }
        Ok(WaitStatus::StillAlive) => {}
        Ok(_) => {}
        Err(_) => {
            conn.cgi_pid = None;
        }
    }
}

/// SIGKILL the child and try to collect it without blocking. A child not
/// yet collectable stays recorded and is reaped on a later attempt.
pub fn kill_child(conn: &mut Connection) {
    if let Some(pid) = conn.cgi_pid {
        kill(pid, Signal::SIGKILL).ok();
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            _ => conn.cgi_pid = None,
        }
    }
}

pub fn has_timed_out(conn: &Connection, now: libc::time_t) -> bool {
    conn.cgi_start != 0 && now - conn.cgi_start >= CGI_TIMEOUT_SECS
}

/// Build the HTTP response out of the child's output: `Status:` overrides
/// the code, `Location:` promotes 200 to 302, `Content-Length:` is
/// recomputed, and everything else passes through.
pub fn synthesize_response(
    config: &ServerConfig,
    now: libc::time_t,
    output: &[u8],
) -> (u16, Vec<u8>) {
    let (header_end, separator) = match http::find(b"\r\n\r\n", output) {
        Some(at) => (at, 4),
        None => match http::find(b"\n\n", output) {
            Some(at) => (at, 2),
            None => {
                let reply = error_reply(config, now, 500, "CGI produced malformed output.");
                return (500, reply);
            }
        },
    };
    let head = String::from_utf8_lossy(&output[..header_end]).into_owned();
    let body = &output[header_end + separator..];

    let mut code: u16 = 200;
    let mut reason = status_text(200).to_string();
    let mut content_type = "text/html".to_string();
    let mut location: Option<String> = None;
    let mut passthrough = String::new();

    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim();
        match name.to_ascii_lowercase().as_str() {
            "status" => match value.find(' ') {
                Some(space) => {
                    code = value[..space].parse().unwrap_or(200);
                    reason = value[space + 1..].to_string();
                }
                None => {
                    code = value.parse().unwrap_or(200);
                    reason = status_text(code).to_string();
                }
            },
            "content-type" => content_type = value.to_string(),
            "location" => {
                location = Some(value.to_string());
                if code == 200 {
                    code = 302;
                    reason = status_text(302).to_string();
                }
            }
            "content-length" => {}
            _ => {
                passthrough.push_str(name);
                passthrough.push_str(": ");
                passthrough.push_str(value);
                passthrough.push_str("\r\n");
            }
        }
    }

    let mut header = format!(
        "HTTP/1.1 {} {}\r\n\
        Content-Type: {}\r\n\
        Content-Length: {}\r\n",
        code,
        reason,
        content_type,
        body.len()
    );
    if let Some(location) = &location {
        header.push_str(&format!("Location: {}\r\n", location));
    }
    header.push_str(&passthrough);
    header.push_str("\r\n");

    let mut response = header.into_bytes();
    response.extend_from_slice(body);
    (code, response)
}
