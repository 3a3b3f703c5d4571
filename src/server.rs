//! Listener setup and the select()-driven event loop. FD interest sets are
//! rebuilt from connection state on every iteration, so exactly one of
//! {client readable, client writable, CGI pipes} is watched per connection.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::socket;
use nix::sys::time::TimeVal;
use nix::unistd::close;

use crate::cgi;
use crate::config::Config;
use crate::conn::{ConnState, ConnectionTable};
use crate::http;
use crate::response::{error_reply, ClfDate, LogEncoded};
use crate::router;

/// Read chunk per client readable event.
const RECV_CHUNK: usize = 1 << 15;
/// A request whose headers never terminate dies at this size.
const MAX_HEADER_LENGTH: usize = 8192;
const LISTEN_BACKLOG: usize = 128;

pub struct Listener {
    pub fd: RawFd,
    pub host: String,
    pub port: u16,
    pub server_index: usize,
}

pub struct Server {
    pub config: Config,
    pub listeners: Vec<Listener>,
    pub now: libc::time_t,
    pub accepting: bool,
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Bind one listening socket per server block. Any failure closes the
/// sockets opened so far.
pub fn bind(config: Config) -> Result<Server> {
    let mut listeners: Vec<Listener> = Vec::new();
    for (index, server_config) in config.servers.iter().enumerate() {
        match init_listener(&server_config.host, server_config.port) {
            Ok(fd) => {
                println!(
                    "listening on http://{}:{}/",
                    server_config.host, server_config.port
                );
                listeners.push(Listener {
                    fd,
                    host: server_config.host.clone(),
                    port: server_config.port,
                    server_index: index,
                });
            }
            Err(e) => {
                for listener in &listeners {
                    close(listener.fd).ok();
                }
                return Err(e).with_context(|| {
                    format!(
                        "failed to listen on {}:{}",
                        server_config.host, server_config.port
                    )
                });
            }
        }
    }
    Ok(Server {
        config,
        listeners,
        now: Utc::now().timestamp() as libc::time_t,
        accepting: true,
        num_requests: 0,
        total_in: 0,
        total_out: 0,
    })
}

fn init_listener(host: &str, port: u16) -> Result<RawFd> {
    let address = Ipv4Addr::from_str(host)
        .with_context(|| format!("malformed listen address {}", host))?;
    let fd = socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    )
    .context("failed to create listening socket")?;

    let result = (|| -> Result<()> {
        socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")?;
        set_nonblocking(fd).context("failed to set listener non-blocking")?;
        set_cloexec(fd).context("failed to set FD_CLOEXEC on listener")?;
        let socket_addr = SocketAddr::V4(SocketAddrV4::new(address, port));
        socket::bind(fd, &socket::SockAddr::Inet(socket::InetAddr::from_std(&socket_addr)))
            .context("failed to bind")?;
        socket::listen(fd, LISTEN_BACKLOG).context("failed to listen")?;
        Ok(())
    })();
    if let Err(e) = result {
        close(fd).ok();
        return Err(e);
    }
    Ok(fd)
}

/// One iteration of the event loop: build interest sets from state, block up
/// to one second, scan CGI timeouts, then route the ready descriptors.
pub fn httpd_poll(server: &mut Server, table: &mut ConnectionTable) {
    let mut recv_set = FdSet::new();
    let mut send_set = FdSet::new();

    if server.accepting {
        for listener in &server.listeners {
            recv_set.insert(listener.fd);
        }
    }
    for fd in table.client_fds() {
        let conn = match table.find(fd) {
            Some(conn) => conn,
            None => continue,
        };
        match conn.state {
            ConnState::ReadingRequest => recv_set.insert(fd),
            ConnState::SendingResponse => send_set.insert(fd),
            ConnState::CgiRunning => {
                if let Some(pipe) = conn.cgi_input_fd {
                    send_set.insert(pipe);
                }
                if let Some(pipe) = conn.cgi_output_fd {
                    recv_set.insert(pipe);
                }
            }
        }
    }

    let mut timeout = TimeVal::from(libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    });
    match select(
        None,
        Some(&mut recv_set),
        Some(&mut send_set),
        None,
        Some(&mut timeout),
    ) {
        Ok(_) => {}
        Err(e) => {
            if e.as_errno() == Some(Errno::EINTR) {
                return; // interrupted by signal
            }
            panic!("select() failed: {}", e);
        }
    }

    server.now = Utc::now().timestamp() as libc::time_t;

    check_cgi_timeouts(server, table);

    let ready_listeners: Vec<usize> = {
        let mut ready = Vec::new();
        for (index, listener) in server.listeners.iter().enumerate() {
            if recv_set.contains(listener.fd) {
                ready.push(index);
            }
        }
        ready
    };
    for index in ready_listeners {
        accept_connection(server, table, index);
    }

    // CGI pipe events route through the pipe map back to their connection.
    for pipe in table.pipe_fds() {
        let client_fd = match table.find_by_pipe(pipe) {
            Some(client_fd) => client_fd,
            None => continue, // detached by an earlier event this iteration
        };
        let (input_pipe, output_pipe) = match table.find(client_fd) {
            Some(conn) => (conn.cgi_input_fd, conn.cgi_output_fd),
            None => continue,
        };
        if input_pipe == Some(pipe) && send_set.contains(pipe) {
            handle_cgi_write(server, table, client_fd);
        } else if output_pipe == Some(pipe) && recv_set.contains(pipe) {
            handle_cgi_read(server, table, client_fd);
        }
    }

    for fd in table.client_fds() {
        let state = match table.find(fd) {
            Some(conn) => conn.state,
            None => continue,
        };
        match state {
            ConnState::ReadingRequest => {
                if recv_set.contains(fd) {
                    handle_read(server, table, fd);
                }
            }
            ConnState::SendingResponse => {
                if send_set.contains(fd) {
                    handle_write(server, table, fd);
                }
            }
            ConnState::CgiRunning => {}
        }
    }
}

/// Accept one connection; level-triggered readiness re-fires for the rest.
fn accept_connection(server: &mut Server, table: &mut ConnectionTable, listener_index: usize) {
    let (listener_fd, server_index) = {
        let listener = &server.listeners[listener_index];
        (listener.fd, listener.server_index)
    };
    let fd = match socket::accept(listener_fd) {
        Ok(fd) => fd,
        Err(e) => {
            match e.as_errno() {
                Some(Errno::EAGAIN) => {}
                Some(Errno::EMFILE) | Some(Errno::ENFILE) => {
                    // Out of fds; stop accepting until a connection frees one.
                    server.accepting = false;
                    eprintln!("warning: accept() failed: {}", e);
                }
                _ => eprintln!("warning: accept() failed: {}", e),
            }
            return;
        }
    };

    let addr = match socket::getpeername(fd) {
        Ok(socket::SockAddr::Inet(addr)) => addr,
        _ => {
            close(fd).ok();
            return;
        }
    };

    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    if stream.set_nonblocking(true).is_err() {
        return; // drop closes the fd
    }
    set_cloexec(fd).ok();

    table.add_client(stream, addr.ip().to_std(), server_index);
}

/// Read newly available request bytes, enforce the body gates, and dispatch
/// once the request is complete.
fn handle_read(server: &mut Server, table: &mut ConnectionTable, fd: RawFd) {
    {
        let conn = match table.find(fd) {
            Some(conn) => conn,
            None => return,
        };
        // Stray readable edges while a child runs are ignored.
        if conn.state == ConnState::CgiRunning {
            return;
        }
    }

    let mut buf = [0u8; RECV_CHUNK];
    let received = match socket::recv(fd, &mut buf, socket::MsgFlags::empty()) {
        Ok(received) if received > 0 => received,
        Err(e) if e.as_errno() == Some(Errno::EAGAIN) => return,
        _ => {
            // closure or hard error
            close_client(server, table, fd);
            return;
        }
    };
    server.total_in += received as u64;

    let conn = match table.find_mut(fd) {
        Some(conn) => conn,
        None => return,
    };
    let old_len = conn.request.len();
    conn.request.extend_from_slice(&buf[..received]);

    if !conn.headers_complete {
        // Overlap the search into the previous tail in case the terminator
        // straddled two reads.
        let from = old_len.saturating_sub(3);
        match http::find(b"\r\n\r\n", &conn.request[from..]) {
            Some(at) => {
                conn.headers_complete = true;
                conn.header_end = from + at + 4;
                conn.body_received = conn.request.len() - conn.header_end;

                let headers =
                    String::from_utf8_lossy(&conn.request[..conn.header_end - 4]).into_owned();
                conn.chunked = http::is_chunked(&headers);
                conn.content_length = http::content_length(&headers);
                let (_, target, _) = http::request_line(&headers);
                let config = server.config.server(conn.server_index);
                conn.body_cap = router::effective_body_cap(config, &target);

                // Early rejection on the declared length.
                if conn.body_cap > 0 && !conn.chunked {
                    if let Some(declared) = conn.content_length {
                        if declared > conn.body_cap {
                            let reply = error_reply(
                                config,
                                server.now,
                                413,
                                "The request body exceeds the configured limit.",
                            );
                            conn.finish(413, reply);
                            return;
                        }
                    }
                }
            }
            None => {
                if conn.request.len() > MAX_HEADER_LENGTH {
                    let config = server.config.server(conn.server_index);
                    let reply = error_reply(
                        config,
                        server.now,
                        413,
                        "Your request was dropped because it was too long.",
                    );
                    conn.finish(413, reply);
                }
                return;
            }
        }
    } else {
        conn.body_received = conn.request.len() - conn.header_end;
    }

    // Progressive rejection as the body streams in. For chunked requests the
    // buffered prefix is decoded on each read (the decoder stops at the first
    // incomplete chunk), so a stream that never terminates still hits the cap.
    if conn.body_cap > 0 {
        let over_cap = if conn.chunked {
            http::decode_chunked(&conn.request[conn.header_end..]).len() as u64 > conn.body_cap
        } else {
            conn.body_received as u64 > conn.body_cap
        };
        if over_cap {
            let config = server.config.server(conn.server_index);
            let reply = error_reply(
                config,
                server.now,
                413,
                "The request body exceeds the configured limit.",
            );
            conn.finish(413, reply);
            return;
        }
    }

    let headers = String::from_utf8_lossy(&conn.request[..conn.header_end - 4]).into_owned();
    let (method, _, _) = http::request_line(&headers);
    if method == "POST" || method == "PUT" {
        if conn.chunked {
            if !http::chunked_complete(&conn.request[conn.header_end..]) {
                return; // wait for the terminal chunk
            }
        } else if let Some(declared) = conn.content_length {
            if (conn.body_received as u64) < declared {
                return; // wait for more body
            }
        } else {
            let config = server.config.server(conn.server_index);
            let reply = error_reply(
                config,
                server.now,
                411,
                "POST and PUT require a Content-Length header.",
            );
            conn.finish(411, reply);
            return;
        }
    }

    server.num_requests += 1;
    let now = server.now;
    let config = server.config.server(conn.server_index);
    router::handle_request(config, now, conn);
    conn.request = Vec::new();
    let spawned_cgi = conn.state == ConnState::CgiRunning;

    if spawned_cgi {
        table.attach_cgi(fd);
    }
}

/// Push response bytes out; on completion either recycle for keep-alive or
/// tear the connection down.
fn handle_write(server: &mut Server, table: &mut ConnectionTable, fd: RawFd) {
    let mut failed = false;
    let mut completed_close = false;
    let mut completed_keep = false;
    {
        let conn = match table.find_mut(fd) {
            Some(conn) => conn,
            None => return,
        };
        if !conn.response_complete() {
            match socket::send(fd, &conn.response[conn.bytes_sent..], socket::MsgFlags::empty()) {
                Ok(sent) if sent > 0 => {
                    conn.bytes_sent += sent;
                    server.total_out += sent as u64;
                }
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => return,
                _ => failed = true,
            }
        }
        if !failed && conn.response_complete() {
            if conn.conn_close {
                completed_close = true;
            } else {
                completed_keep = true;
            }
        }
    }
    if failed || completed_close {
        close_client(server, table, fd);
    } else if completed_keep {
        if let Some(conn) = table.find_mut(fd) {
            // Collect a child that was still winding down when its output
            // finished.
            if conn.cgi_pid.is_some() {
                cgi::reap(conn);
            }
            log_connection(server, conn);
            conn.recycle();
        }
    }
}

/// Feed the request body to the child's stdin; the pipe is closed as soon as
/// the body is drained so scripts reading to EOF can finish.
fn handle_cgi_write(server: &mut Server, table: &mut ConnectionTable, fd: RawFd) {
    let progress = match table.find_mut(fd) {
        Some(conn) => cgi::write_body(conn),
        None => return,
    };
    match progress {
        cgi::PipeProgress::Again | cgi::PipeProgress::Advanced => {}
        cgi::PipeProgress::Done => table.detach_cgi_input(fd),
        cgi::PipeProgress::Failed => {
            if let Some(conn) = table.find_mut(fd) {
                cgi::kill_child(conn);
            }
            table.detach_cgi(fd);
            if let Some(conn) = table.find_mut(fd) {
                let config = server.config.server(conn.server_index);
                let reply = error_reply(config, server.now, 500, "CGI execution failed.");
                conn.finish(500, reply);
            }
        }
    }
}

/// Accumulate child output; EOF or error finalizes the response.
fn handle_cgi_read(server: &mut Server, table: &mut ConnectionTable, fd: RawFd) {
    let progress = match table.find_mut(fd) {
        Some(conn) => cgi::read_output(conn),
        None => return,
    };
    match progress {
        cgi::PipeProgress::Again | cgi::PipeProgress::Advanced => return,
        cgi::PipeProgress::Done | cgi::PipeProgress::Failed => {}
    }

    let (code, reply) = {
        let conn = match table.find_mut(fd) {
            Some(conn) => conn,
            None => return,
        };
        cgi::reap(conn);
        let config = server.config.server(conn.server_index);
        cgi::synthesize_response(config, server.now, &conn.cgi_output)
    };
    table.detach_cgi(fd);
    if let Some(conn) = table.find_mut(fd) {
        conn.finish(code, reply);
    }
}

/// Kill children that have been running longer than the CGI timeout and
/// answer 504.
fn check_cgi_timeouts(server: &mut Server, table: &mut ConnectionTable) {
    for fd in table.client_fds() {
        let timed_out = match table.find(fd) {
            Some(conn) => conn.state == ConnState::CgiRunning && cgi::has_timed_out(conn, server.now),
            None => false,
        };
        if !timed_out {
            continue;
        }
        eprintln!("warning: CGI process timed out, killing it");
        if let Some(conn) = table.find_mut(fd) {
            cgi::kill_child(conn);
        }
        table.detach_cgi(fd);
        if let Some(conn) = table.find_mut(fd) {
            let config = server.config.server(conn.server_index);
            let reply = error_reply(config, server.now, 504, "The CGI script timed out.");
            conn.finish(504, reply);
        }
    }
}

/// Log and destroy a connection.
fn close_client(server: &mut Server, table: &mut ConnectionTable, fd: RawFd) {
    if let Some(conn) = table.find(fd) {
        log_connection(server, conn);
    }
    table.remove_client(fd);
    server.accepting = true; // try to resume accepting if we ran out of fds
}

/// One Common Log Format line per completed response.
fn log_connection(server: &Server, conn: &crate::conn::Connection) {
    if conn.http_code == 0 {
        return; // died before producing a response
    }
    let method = match &conn.method {
        Some(method) => method,
        None => return,
    };
    println!(
        "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"",
        conn.client,
        ClfDate(server.now),
        LogEncoded(method),
        LogEncoded(conn.url.as_deref().unwrap_or("")),
        conn.http_code,
        conn.bytes_sent,
        LogEncoded(conn.referer.as_deref().unwrap_or("")),
        LogEncoded(conn.user_agent.as_deref().unwrap_or("")),
    );
}
