use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

pub fn get_unused_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .expect("failed to bind probe socket")
        .local_addr()
        .unwrap()
        .port()
}

pub fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

pub struct ScopedChild(pub Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// Spawn the server binary against a config file.
pub fn spawn_server(config_path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_wrenhttpd"))
        .arg(config_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn server")
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Start a server whose document root is a fresh tempdir. `extra`
    /// produces additional server-block directives given the root path.
    pub fn start(extra: impl FnOnce(&Path) -> String) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let port = get_unused_port();
        let config_text = format!(
            "server {{\n\
            \x20   listen 127.0.0.1:{};\n\
            \x20   root {};\n\
            \x20   index index.html;\n\
            {}\n\
            }}\n",
            port,
            root.path().display(),
            extra(root.path()),
        );
        let config_path = root.path().join("server.conf");
        fs::write(&config_path, config_text).expect("failed to write config");

        let child = spawn_server(&config_path).into();
        let server = Self {
            _child: child,
            port,
            root,
        };
        assert!(wait_for_port(server.port), "failed to connect to server");
        server
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        fs::create_dir_all(&path).expect("failed to create directory");
        path
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, contents).expect("failed to create file");
        path
    }

    pub fn create_executable(&self, name: &str, contents: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = self.create_file(name, contents.as_bytes());
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("failed to chmod script");
        path
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server");
        // Timeouts prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// Send one raw request and read until the server closes the connection.
    /// The request should carry `Connection: close`.
    pub fn raw(&self, request: &str) -> String {
        let mut stream = self.stream();
        stream.write_all(request.as_bytes()).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Split a raw response into (status line, headers, body).
pub fn parse(response: &str) -> (&str, HashMap<&str, &str>, &str) {
    let mut parts = response.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap();
    let body = parts.next().unwrap_or("");

    let mut header_lines = head.split("\r\n");
    let status_line = header_lines.next().unwrap();
    let mut headers = HashMap::new();
    for header_line in header_lines {
        let mut header = header_line.splitn(2, ": ");
        let key = header.next().unwrap();
        if let Some(value) = header.next() {
            headers.insert(key, value);
        }
    }
    (status_line, headers, body)
}

/// A framed HTTP response read off a (possibly kept-alive) stream.
pub struct Response {
    pub status_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let status_line = Self::read_line(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            status_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_line(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_line<R: Read>(reader: &mut R) -> io::Result<String> {
        let mut byte = [0; 1];
        let mut buf = Vec::new();
        loop {
            reader.read_exact(&mut byte)?;
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n") {
                buf.truncate(buf.len() - 2);
                return Ok(String::from_utf8(buf).expect("response line is not valid UTF-8"));
            }
        }
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(self.body.as_deref().unwrap_or(b"")).into_owned()
    }
}
