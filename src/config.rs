use std::collections::HashMap;
use std::fs;

use anyhow::{anyhow, bail, Context, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ROOT: &str = "./www";
const DEFAULT_INDEX: &str = "index.html";
const DEFAULT_MAX_BODY_SIZE: u64 = 1048576;

/// One `server { ... }` block. Immutable after load.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root: String,
    pub index: String,
    pub autoindex: bool,
    /// 0 means unlimited.
    pub client_max_body_size: u64,
    pub error_pages: HashMap<u16, String>,
    pub locations: Vec<LocationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            root: DEFAULT_ROOT.to_string(),
            index: DEFAULT_INDEX.to_string(),
            autoindex: false,
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: HashMap::new(),
            locations: Vec::new(),
        }
    }
}

/// One `location <path> { ... }` block. `None` fields inherit from the server.
#[derive(Debug, Clone, Default)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<String>,
    pub alias: Option<String>,
    /// Empty means no restriction.
    pub allow_methods: Vec<String>,
    pub index: Option<String>,
    pub autoindex: Option<bool>,
    pub upload_store: Option<String>,
    /// Interpreter paths, parallel to `cgi_ext`; the last one is reused when
    /// `cgi_ext` is longer.
    pub cgi_path: Vec<String>,
    pub cgi_ext: Vec<String>,
    /// `<code> <target>` with code 301 or 302.
    pub redirect: Option<String>,
    /// `Some(0)` means unlimited for this location; `None` inherits.
    pub client_max_body_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot open configuration file {}", path))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path))
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut servers = Vec::new();
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with("server") && line.contains('{') {
                servers.push(parse_server_block(&mut lines)?);
            }
        }
        if servers.is_empty() {
            bail!("no server blocks found in configuration");
        }
        for (i, a) in servers.iter().enumerate() {
            for b in servers.iter().skip(i + 1) {
                if a.host == b.host && a.port == b.port {
                    bail!("duplicate server binding for {}:{}", a.host, a.port);
                }
            }
        }
        Ok(Config { servers })
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server(&self, index: usize) -> &ServerConfig {
        &self.servers[index]
    }
}

fn strip_inline_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim_end(),
        None => line,
    }
}

fn strip_semicolon(line: &str) -> &str {
    line.strip_suffix(';').unwrap_or(line)
}

/// Directive lines must end with a semicolon; block delimiters are exempt.
fn check_terminator(line: &str) -> Result<()> {
    if line.starts_with("location") || line.contains('{') || line.contains('}') {
        return Ok(());
    }
    if !line.ends_with(';') {
        bail!("missing semicolon after directive: {}", line);
    }
    Ok(())
}

fn parse_server_block(lines: &mut std::str::Lines) -> Result<ServerConfig> {
    let mut server = ServerConfig::default();
    while let Some(raw) = lines.next() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = strip_inline_comment(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with('}') {
            break;
        }
        check_terminator(line)?;
        if line.starts_with("location") {
            server.locations.push(parse_location_block(line, lines)?);
            continue;
        }
        let line = strip_semicolon(line);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        apply_server_directive(&tokens, &mut server)?;
    }
    Ok(server)
}

fn parse_location_block(header: &str, lines: &mut std::str::Lines) -> Result<LocationConfig> {
    let mut location = LocationConfig::default();
    let brace = header
        .find('{')
        .ok_or_else(|| anyhow!("invalid location syntax: {}", header))?;
    let path = header["location".len()..brace].trim();
    if path.is_empty() || !path.starts_with('/') {
        bail!("location path must begin with '/': {}", header);
    }
    location.path = path.to_string();

    while let Some(raw) = lines.next() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = strip_inline_comment(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with('}') {
            break;
        }
        check_terminator(line)?;
        let line = strip_semicolon(line);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        apply_location_directive(&tokens, &mut location)?;
    }
    Ok(location)
}

fn parse_body_size(value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| anyhow!("invalid client_max_body_size (must be non-negative): {}", value))
}

fn apply_server_directive(tokens: &[&str], server: &mut ServerConfig) -> Result<()> {
    match tokens[0] {
        "listen" if tokens.len() >= 2 => {
            let value = tokens[1];
            let port_str = match value.find(':') {
                Some(colon) => {
                    server.host = value[..colon].to_string();
                    &value[colon + 1..]
                }
                None => value,
            };
            let port: u32 = port_str
                .parse()
                .map_err(|_| anyhow!("invalid port number {}", port_str))?;
            if port < 1 || port > 65535 {
                bail!("invalid port number {} (must be 1-65535)", port);
            }
            server.port = port as u16;
        }
        "root" if tokens.len() >= 2 => server.root = tokens[1].to_string(),
        "index" if tokens.len() >= 2 => server.index = tokens[1].to_string(),
        "autoindex" if tokens.len() >= 2 => server.autoindex = tokens[1] == "on",
        "client_max_body_size" if tokens.len() >= 2 => {
            server.client_max_body_size = parse_body_size(tokens[1])?;
        }
        "error_page" if tokens.len() >= 3 => {
            let path = tokens[tokens.len() - 1].to_string();
            for code in &tokens[1..tokens.len() - 1] {
                let code: u16 = code
                    .parse()
                    .map_err(|_| anyhow!("invalid error_page code {}", code))?;
                server.error_pages.insert(code, path.clone());
            }
        }
        // Unknown directives are ignored.
        _ => {}
    }
    Ok(())
}

fn apply_location_directive(tokens: &[&str], location: &mut LocationConfig) -> Result<()> {
    match tokens[0] {
        "root" if tokens.len() >= 2 => location.root = Some(tokens[1].to_string()),
        "alias" if tokens.len() >= 2 => location.alias = Some(tokens[1].to_string()),
        "allow_methods" if tokens.len() >= 2 => {
            for method in &tokens[1..] {
                location.allow_methods.push(method.to_string());
            }
        }
        "index" if tokens.len() >= 2 => location.index = Some(tokens[1].to_string()),
        "autoindex" if tokens.len() >= 2 => location.autoindex = Some(tokens[1] == "on"),
        "upload_store" if tokens.len() >= 2 => {
            location.upload_store = Some(tokens[1].to_string())
        }
        "cgi_path" if tokens.len() >= 2 => {
            for path in &tokens[1..] {
                location.cgi_path.push(path.to_string());
            }
        }
        "cgi_ext" if tokens.len() >= 2 => {
            for ext in &tokens[1..] {
                location.cgi_ext.push(ext.to_string());
            }
        }
        "return" if tokens.len() >= 2 => {
            location.redirect = Some(tokens[1..].join(" "));
        }
        "client_max_body_size" if tokens.len() >= 2 => {
            location.client_max_body_size = Some(parse_body_size(tokens[1])?);
        }
        _ => {}
    }
    Ok(())
}
