//! `WDEP/1.0` server driver: a loopback TCP accept loop around
//! [`windepends_core::server::dispatch`].
//!
//! Grounded on `connect_loop`/`client_thread` in `main.c`: accept
//! connections on a fixed port, hand each one to its own thread, read
//! UTF-16LE CRLF-terminated lines, dispatch, and write the reply back. The
//! real socket plumbing is the ambient surface `src/server.rs` deliberately
//! stays free of, so it can be exercised without a network in tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use windepends_core::apiset::ApiSetNamespace;
use windepends_core::knowndlls::{FileKnownDllsSource, KnownDllsList, KnownDllsSource};
use windepends_core::server::{dispatch, split_command, DispatchOutcome};
use windepends_core::session::{Session, SupportContext};
use windepends_core::wire::{encode_response, LineReader};

/// Maximum concurrently served client connections, mirroring `APP_MAXUSERS`
/// (spec.md §5: "the shipped caller enforces `MAX_USERS = 1`").
const MAX_CLIENTS: usize = 1;

#[derive(Parser, Debug)]
#[command(name = "wdep-serverd", about = "WDEP/1.0 PE analysis server")]
struct Args {
    /// TCP port to listen on, loopback-only.
    #[arg(long, default_value_t = 8209)]
    port: u16,

    /// Optional ApiSet namespace blob to load as the process-default map.
    #[arg(long)]
    apisetmap: Option<String>,

    /// Optional KnownDlls fixture (`name\tpath` text, `--` separated blocks).
    #[arg(long)]
    knowndlls: Option<String>,

    /// Step size (bytes) used when scanning for a free virtual base.
    #[arg(long, default_value_t = 0x10000)]
    allocation_granularity: u64,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let default_apiset: Option<ApiSetNamespace> = args.apisetmap.as_ref().and_then(|path| {
        match std::fs::read(path)
            .map_err(windepends_core::error::EngineError::from)
            .and_then(windepends_core::apiset::parse)
        {
            Ok(ns) => Some(ns),
            Err(err) => {
                warn!(%err, %path, "failed to load initial ApiSet map, starting without one");
                None
            }
        }
    });

    let known_dlls = args
        .knowndlls
        .as_ref()
        .map(|path| FileKnownDllsSource { path: std::path::Path::new(path) })
        .and_then(|source| match source.load() {
            Ok(list) => Some(list),
            Err(err) => {
                warn!(%err, "failed to load KnownDlls fixture, starting with empty lists");
                None
            }
        })
        .unwrap_or_default();

    let ctx = Arc::new(SupportContext::init(
        default_apiset,
        known_dlls,
        args.allocation_granularity,
        true,
    ));

    // Matches `connect_loop`'s staged startup (exit codes per spec §6):
    // 3 = address parse, 4 = bind. `TcpListener::bind` folds socket creation
    // and `listen()` into the same call as `bind()`, so those two steps
    // (codes 1/2/5 in the original's finer-grained syscall sequence) are not
    // separately distinguishable here.
    let addr: std::net::SocketAddr = match format!("127.0.0.1:{}", args.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, port = args.port, "failed to parse listen address");
            std::process::exit(3);
        }
    };

    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, port = args.port, "failed to bind server socket");
            std::process::exit(4);
        }
    };

    info!(port = args.port, "WDEP/1.0 server listening");

    let active_clients = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let Ok(stream) = stream else { continue };

        if active_clients.load(Ordering::SeqCst) >= MAX_CLIENTS {
            warn!("maximum allowed clients connected, rejecting new connection");
            drop(stream);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        let active_clients = Arc::clone(&active_clients);
        let shutdown = Arc::clone(&shutdown);

        active_clients.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            serve_client(stream, &ctx, &shutdown);
            active_clients.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn serve_client(mut stream: TcpStream, ctx: &SupportContext, shutdown: &std::sync::atomic::AtomicBool) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(%peer, "client connected");

    let mut session = Session::new();
    let mut reader = LineReader::new();
    let mut scratch = [0u8; 8192];

    loop {
        while let Some(line) = reader.next_line() {
            let (cmd, params) = split_command(&line);
            info!(%peer, cmd, params = params.unwrap_or(""), "dispatching command");

            match dispatch(&mut session, ctx, cmd, params) {
                DispatchOutcome::Reply(text) => {
                    if stream.write_all(&encode_response(&text)).is_err() {
                        return;
                    }
                }
                DispatchOutcome::NoReply => {}
                DispatchOutcome::ExitSession => {
                    info!(%peer, "client requested exit");
                    return;
                }
                DispatchOutcome::Shutdown => {
                    info!(%peer, "client requested server shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }

        if reader.guard_against_unbounded_growth(1 << 20).is_err() {
            warn!(%peer, "request line too long, dropping connection");
            return;
        }

        match stream.read(&mut scratch) {
            Ok(0) => {
                info!(%peer, "client disconnected");
                return;
            }
            Ok(n) => reader.feed(&scratch[..n]),
            Err(err) => {
                warn!(%peer, %err, "read error, dropping connection");
                return;
            }
        }
    }
}
