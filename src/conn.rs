use std::collections::HashMap;
use std::net::{IpAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::unistd::Pid;

/// Per-connection position in the request/response cycle. During CgiRunning
/// only the child's pipes are watched; the client socket is quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingRequest,
    CgiRunning,
    SendingResponse,
}

/// Everything the event loop knows about one client.
pub struct Connection {
    /// Owns the client fd; dropping the connection closes it.
    pub socket: TcpStream,
    pub client: IpAddr,
    pub server_index: usize,
    pub state: ConnState,

    pub request: Vec<u8>,
    pub headers_complete: bool,
    /// One past the header-terminating CRLFCRLF.
    pub header_end: usize,
    pub body_received: usize,
    /// Effective cap chosen at header-complete time; 0 means unlimited.
    pub body_cap: u64,
    pub chunked: bool,
    pub content_length: Option<u64>,

    pub method: Option<String>,
    pub url: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub http_code: u16,
    pub conn_close: bool,

    pub response: Vec<u8>,
    pub bytes_sent: usize,

    pub cgi_pid: Option<Pid>,
    /// Write end towards the child's stdin.
    pub cgi_input_fd: Option<RawFd>,
    /// Read end from the child's stdout.
    pub cgi_output_fd: Option<RawFd>,
    pub cgi_body: Vec<u8>,
    pub cgi_body_offset: usize,
    pub cgi_output: Vec<u8>,
    pub cgi_script_name: String,
    pub cgi_start: libc::time_t,
}

impl Connection {
    pub fn new(socket: TcpStream, client: IpAddr, server_index: usize) -> Self {
        Self {
            socket,
            client,
            server_index,
            state: ConnState::ReadingRequest,
            request: Vec::new(),
            headers_complete: false,
            header_end: 0,
            body_received: 0,
            body_cap: 0,
            chunked: false,
            content_length: None,
            method: None,
            url: None,
            referer: None,
            user_agent: None,
            http_code: 0,
            conn_close: true,
            response: Vec::new(),
            bytes_sent: 0,
            cgi_pid: None,
            cgi_input_fd: None,
            cgi_output_fd: None,
            cgi_body: Vec::new(),
            cgi_body_offset: 0,
            cgi_output: Vec::new(),
            cgi_script_name: String::new(),
            cgi_start: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Record the finished response and advance to SendingResponse. Error
    /// statuses force the connection closed once the response drains.
    pub fn finish(&mut self, code: u16, response: Vec<u8>) {
        self.http_code = code;
        if code >= 400 {
            self.conn_close = true;
        }
        self.response = response;
        self.bytes_sent = 0;
        self.state = ConnState::SendingResponse;
    }

    pub fn response_complete(&self) -> bool {
        self.bytes_sent >= self.response.len()
    }

    /// Reset for another request on the same socket (keep-alive).
    pub fn recycle(&mut self) {
        self.state = ConnState::ReadingRequest;
        self.request = Vec::new();
        self.headers_complete = false;
        self.header_end = 0;
        self.body_received = 0;
        self.body_cap = 0;
        self.chunked = false;
        self.content_length = None;
        self.method = None;
        self.url = None;
        self.referer = None;
        self.user_agent = None;
        self.http_code = 0;
        self.conn_close = true;
        self.response = Vec::new();
        self.bytes_sent = 0;
    }
}

/// Sole owner of admitted client sockets and CGI pipe ends. Whatever fd is
/// handed in here gets closed in here.
pub struct ConnectionTable {
    clients: HashMap<RawFd, Connection>,
    /// pipe fd -> owning client fd
    pipes: HashMap<RawFd, RawFd>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            pipes: HashMap::new(),
        }
    }

    pub fn add_client(&mut self, socket: TcpStream, client: IpAddr, server_index: usize) -> RawFd {
        let fd = socket.as_raw_fd();
        self.clients
            .insert(fd, Connection::new(socket, client, server_index));
        fd
    }

    /// Drop a client: kill and reap any outstanding CGI child, close its
    /// pipes, and close the socket.
    pub fn remove_client(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.clients.remove(&fd) {
            crate::cgi::kill_child(&mut conn);
            if let Some(pipe) = conn.cgi_input_fd.take() {
                self.pipes.remove(&pipe);
                nix::unistd::close(pipe).ok();
            }
            if let Some(pipe) = conn.cgi_output_fd.take() {
                self.pipes.remove(&pipe);
                nix::unistd::close(pipe).ok();
            }
        }
    }

    pub fn find(&self, fd: RawFd) -> Option<&Connection> {
        self.clients.get(&fd)
    }

    pub fn find_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.clients.get_mut(&fd)
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Register a freshly spawned child's pipes for event routing.
    pub fn attach_cgi(&mut self, fd: RawFd) {
        let (input, output) = match self.clients.get(&fd) {
            Some(conn) => (conn.cgi_input_fd, conn.cgi_output_fd),
            None => return,
        };
        if let Some(pipe) = input {
            self.pipes.insert(pipe, fd);
        }
        if let Some(pipe) = output {
            self.pipes.insert(pipe, fd);
        }
    }

    /// Unregister and close both pipe ends, and drop the buffered CGI state.
    pub fn detach_cgi(&mut self, fd: RawFd) {
        let (input, output) = match self.clients.get_mut(&fd) {
            Some(conn) => {
                conn.cgi_body = Vec::new();
                conn.cgi_body_offset = 0;
                conn.cgi_output = Vec::new();
                conn.cgi_start = 0;
                (conn.cgi_input_fd.take(), conn.cgi_output_fd.take())
            }
            None => return,
        };
        if let Some(pipe) = input {
            self.pipes.remove(&pipe);
            nix::unistd::close(pipe).ok();
        }
        if let Some(pipe) = output {
            self.pipes.remove(&pipe);
            nix::unistd::close(pipe).ok();
        }
    }

    /// Close only the child's stdin once the request body has drained; the
    /// output pipe keeps going.
    pub fn detach_cgi_input(&mut self, fd: RawFd) {
        let input = match self.clients.get_mut(&fd) {
            Some(conn) => conn.cgi_input_fd.take(),
            None => return,
        };
        if let Some(pipe) = input {
            self.pipes.remove(&pipe);
            nix::unistd::close(pipe).ok();
        }
    }

    pub fn find_by_pipe(&self, pipe_fd: RawFd) -> Option<RawFd> {
        self.pipes.get(&pipe_fd).copied()
    }

    pub fn pipe_fds(&self) -> Vec<RawFd> {
        self.pipes.keys().copied().collect()
    }

    pub fn is_pipe(&self, fd: RawFd) -> bool {
        self.pipes.contains_key(&fd)
    }

    /// Tear down every connection (shutdown path).
    pub fn clear_all(&mut self) {
        for fd in self.client_fds() {
            self.remove_client(fd);
        }
    }
}
