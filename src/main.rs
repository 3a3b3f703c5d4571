use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::close;

mod cgi;
mod config;
mod conn;
mod handlers;
mod http;
mod response;
mod router;
mod server;

use config::Config;
use conn::ConnectionTable;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn usage(argv0: &str) {
    eprintln!("usage: {} /path/to/config", argv0);
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        usage(args.get(0).map(|s| s.as_str()).unwrap_or(env!("CARGO_PKG_NAME")));
        bail!("expected exactly one argument");
    }

    let config = Config::load(&args[1])?;
    println!(
        "{}/{}: loaded {} server block(s) from {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.server_count(),
        args[1],
    );

    let mut server = server::bind(config)?;
    let mut table = ConnectionTable::new();

    // SIGPIPE must not kill the process mid-send; INT/TERM flip the shutdown
    // flag and the loop unwinds on its next wakeup.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .map_err(|e| anyhow!("failed to set SIGPIPE handler: {}", e))?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .map_err(|e| anyhow!("failed to set SIGINT handler: {}", e))?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .map_err(|e| anyhow!("failed to set SIGTERM handler: {}", e))?;

    while is_running() {
        server::httpd_poll(&mut server, &mut table);
    }

    // clean exit: drop every connection (killing outstanding CGI children),
    // then the listeners
    println!("\nshutting down");
    table.clear_all();
    for listener in &server.listeners {
        close(listener.fd).ok();
    }

    println!("Requests: {}", server.num_requests);
    println!("Bytes: {} in, {} out", server.total_in, server.total_out);
    Ok(())
}
