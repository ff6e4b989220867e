//! Per-command request handlers (the command table in spec.md §6).
//!
//! Grounded on `cmd.c`'s `cmd_*` family and `pe32plus.c`'s `get_headers`/
//! `get_imports`/`get_exports`/`get_datadirs`: each function here takes the
//! already-split `(command, params)` pair plus the session/support-context
//! state and produces the full wire line(s) a driver would write back to the
//! client — one [`crate::protocol::StatusLine`], optionally followed by one
//! JSON document, per spec.md §6's framing. The TCP accept loop itself
//! (`recvcmd`/`client_thread` in `main.c`) is the excluded external
//! collaborator (spec.md §1); `src/bin/wdep-serverd.rs` supplies a minimal
//! ambient one, but this module has no socket in it and is exercised
//! directly by tests.

use std::path::PathBuf;
use std::time::Instant;

use crate::apiset;
use crate::error::EngineError;
use crate::exports::walk_exports;
use crate::headers::{build_datadirs_json, build_headers_json};
use crate::image::{self, build_open_json, OpenConfig};
use crate::imports::walk_imports;
use crate::knowndlls::KnownDllsBitness;
use crate::params::{get_value, has_flag, tokenize};
use crate::protocol::{json_escape, status_for_error, StatusLine};
use crate::session::{Session, SupportContext};

/// What the caller (the ambient TCP driver, or a test) should do after one
/// command has been dispatched.
pub enum DispatchOutcome {
    /// Write this text to the client verbatim, then keep the session open.
    Reply(String),
    /// Nothing is written to the wire (`close`'s response is "(none)").
    NoReply,
    /// `exit`: close this session (driver should stop reading more commands
    /// from this connection) without writing anything.
    ExitSession,
    /// `shutdown`: the whole server should stop accepting connections.
    Shutdown,
}

fn ok(body: String) -> DispatchOutcome {
    DispatchOutcome::Reply(format!("{}{}\r\n", StatusLine::Ok.as_wire_str(), body))
}

fn bare_status(status: StatusLine) -> DispatchOutcome {
    DispatchOutcome::Reply(status.as_wire_str().to_string())
}

fn bare_error(err: &EngineError) -> DispatchOutcome {
    bare_status(status_for_error(err))
}

/// Split a request line's first token (the command word) from the rest
/// (the raw params string, `None` if empty), per spec.md §6: commands are
/// matched on the first token only, case-insensitively, and exactly — a
/// command word must not be treated as a prefix of a longer one (`open`
/// must not match a line starting `opens`).
pub fn split_command(line: &str) -> (&str, Option<&str>) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((cmd, rest)) => {
            let rest = rest.trim_start();
            (cmd, if rest.is_empty() { None } else { Some(rest) })
        }
        None => (line, None),
    }
}

/// Dispatch one already-split request to its handler.
pub fn dispatch(session: &mut Session, ctx: &SupportContext, cmd: &str, params: Option<&str>) -> DispatchOutcome {
    match cmd.to_ascii_lowercase().as_str() {
        "open" => cmd_open(session, ctx, params),
        "close" => {
            session.close();
            DispatchOutcome::NoReply
        }
        "headers" => cmd_headers(session),
        "datadirs" => cmd_datadirs(session),
        "imports" => cmd_imports(session),
        "exports" => cmd_exports(session),
        "knowndlls" => cmd_knowndlls(ctx, params),
        "apisetresolve" => cmd_apisetresolve(ctx, params),
        "apisetmapsrc" => cmd_apisetmapsrc(ctx, params),
        "apisetnsinfo" => cmd_apisetnsinfo(ctx, params),
        "callstats" => cmd_callstats(session),
        "shutdown" => DispatchOutcome::Shutdown,
        "exit" => {
            session.close();
            DispatchOutcome::ExitSession
        }
        _ => bare_status(StatusLine::CommandUnknown),
    }
}

fn cmd_open(session: &mut Session, ctx: &SupportContext, params: Option<&str>) -> DispatchOutcome {
    let Some(params) = params else {
        return bare_status(StatusLine::InvalidParameters);
    };
    let tokens = tokenize(params);
    let Some(file) = get_value(&tokens, "file") else {
        return bare_status(StatusLine::InvalidParameters);
    };

    let custom_base = get_value(&tokens, "custom_image_base").and_then(|v| v.parse::<u32>().ok());
    // Matching `cmd_open` in cmd.c: supplying a custom base implies
    // `process_relocs`, since the loaded address is no longer `ImageBase`.
    let process_relocs = has_flag(params, "process_relocs") || custom_base.is_some();
    let use_stats = has_flag(params, "use_stats");

    let cfg = OpenConfig {
        process_relocs,
        custom_base: custom_base.map(|b| b as u64),
        allocation_granularity: ctx.allocation_granularity,
    };

    match image::open(&PathBuf::from(file), &cfg) {
        Ok((mut opened, summary)) => {
            if use_stats {
                opened.stats = Some(Default::default());
            }
            let body = build_open_json(&summary);
            session.image = Some(opened);
            ok(body)
        }
        Err(err) => bare_error(&err),
    }
}

fn cmd_headers(session: &mut Session) -> DispatchOutcome {
    let started = Instant::now();
    let result = session.require_image().and_then(build_headers_json);
    match result {
        Ok(body) => finish_with_stats(session, ok(body), started),
        Err(err) => bare_error(&err),
    }
}

fn cmd_datadirs(session: &mut Session) -> DispatchOutcome {
    match session.require_image() {
        Ok(image) => ok(build_datadirs_json(image)),
        Err(err) => bare_error(&err),
    }
}

fn cmd_imports(session: &mut Session) -> DispatchOutcome {
    let image = match session.require_image() {
        Ok(image) => image,
        Err(err) => return bare_error(&err),
    };

    let dirs = image.optional.data_directories();
    let standard_dir = Some((dirs.import_table.virtual_address, dirs.import_table.size));
    let delay_dir = Some((
        dirs.delay_import_descriptor.virtual_address,
        dirs.delay_import_descriptor.size,
    ));

    let result = walk_imports(
        &image.view(),
        standard_dir,
        delay_dir,
        image.size_of_image(),
        image.optional.size_of_headers() as u64,
        image.declared_image_base,
        image.is_64bit(),
    );

    let (delay_libs, standard_libs): (Vec<_>, Vec<_>) = result.libraries.into_iter().partition(|l| l.delay);
    let exception_code_std = if result.exception & 1 != 0 { 1 } else { 0 };
    let exception_code_delay = if result.exception & 2 != 0 { 1 } else { 0 };

    let body = format!(
        "{{\"exception\":{},\"exception_code_std\":{},\"exception_code_delay\":{},\
          \"libraries\":{},\"libraries_delay\":{}}}",
        result.exception,
        exception_code_std,
        exception_code_delay,
        serde_json::to_string(&standard_libs).unwrap_or_else(|_| "[]".to_string()),
        serde_json::to_string(&delay_libs).unwrap_or_else(|_| "[]".to_string()),
    );
    ok(body)
}

fn cmd_exports(session: &mut Session) -> DispatchOutcome {
    let image = match session.require_image() {
        Ok(image) => image,
        Err(err) => return bare_error(&err),
    };
    let dir = image.optional.data_directories().export_table;
    if dir.virtual_address == 0 {
        return ok("{\"library\":null}".to_string());
    }
    match walk_exports(&image.view(), dir.virtual_address, dir.size) {
        Ok(library) => {
            let json = serde_json::to_string(&library).unwrap_or_else(|_| "null".to_string());
            ok(format!("{{\"library\":{}}}", json))
        }
        Err(err) => bare_error(&err),
    }
}

fn cmd_knowndlls(ctx: &SupportContext, params: Option<&str>) -> DispatchOutcome {
    let Some(bitness) = params.and_then(KnownDllsBitness::parse) else {
        return bare_status(StatusLine::CannotAllocateResources);
    };
    let (path, entries) = ctx.known_dlls.bucket(bitness);
    let mut body = String::from("{\"path\":\"");
    body.push_str(&json_escape(path));
    body.push_str("\", \"entries\":[");
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push('"');
        body.push_str(&json_escape(&entry.name));
        body.push('"');
    }
    body.push_str("]}");
    ok(body)
}

fn cmd_apisetresolve(ctx: &SupportContext, params: Option<&str>) -> DispatchOutcome {
    let Some(contract_name) = params else {
        return bare_status(StatusLine::InvalidParameters);
    };
    let resolution = ctx.with_apiset(|ns| match ns {
        Some(ns) => ns.resolve(contract_name, None),
        None => Err(EngineError::ApiSetNotPresent),
    });
    match resolution {
        Ok(host) => ok(format!("{{\"path\":\"{}\"}}", json_escape(&host))),
        Err(err) => bare_error(&err),
    }
}

fn cmd_apisetmapsrc(ctx: &SupportContext, params: Option<&str>) -> DispatchOutcome {
    match params {
        None => {
            ctx.reset_apiset_to_default(None);
            bare_status(StatusLine::Ok)
        }
        Some(params) => {
            let tokens = tokenize(params);
            let Some(file) = get_value(&tokens, "file") else {
                return bare_status(StatusLine::InvalidParameters);
            };
            let path = PathBuf::from(file);
            match std::fs::read(&path).map_err(EngineError::from).and_then(apiset::parse) {
                Ok(namespace) => match ctx.set_apiset_from_file(path, namespace) {
                    Ok(()) => bare_status(StatusLine::Ok),
                    Err(err) => bare_error(&err),
                },
                Err(err) => bare_error(&err),
            }
        }
    }
}

fn cmd_apisetnsinfo(ctx: &SupportContext, params: Option<&str>) -> DispatchOutcome {
    let loaded_from_file = params.and_then(|p| {
        let tokens = tokenize(p);
        get_value(&tokens, "file").map(PathBuf::from)
    });

    let parsed = match loaded_from_file {
        Some(path) => std::fs::read(&path).map_err(EngineError::from).and_then(apiset::parse),
        None => ctx
            .with_apiset(|ns| ns.cloned())
            .ok_or(EngineError::ContextNotAllocated),
    };

    match parsed {
        Ok(namespace) => ok(format!(
            "{{\"version\":{}, \"count\":{}}}",
            namespace.version(),
            namespace.count()
        )),
        Err(EngineError::UnsupportedApiSetVersion(_)) => bare_status(StatusLine::UnknownDataFormat),
        Err(err) => bare_error(&err),
    }
}

fn cmd_callstats(session: &mut Session) -> DispatchOutcome {
    let image = match session.require_image() {
        Ok(image) => image,
        Err(err) => return bare_error(&err),
    };
    let stats = image.stats.clone().unwrap_or_default();
    ok(format!(
        "{{\"totalBytesSent\":{},\"totalSendCalls\":{},\"totalTimeSpent\":{}}}",
        stats.total_bytes_sent, stats.total_send_calls, stats.total_time_spent_micros
    ))
}

/// Record `outcome`'s byte length against the currently open image's stats
/// (when call-stats tracking was requested on `open`), mirroring
/// `sendstring_plaintext`'s bookkeeping vs. `sendstring_plaintext_no_track`.
fn finish_with_stats(session: &mut Session, outcome: DispatchOutcome, started: Instant) -> DispatchOutcome {
    if let DispatchOutcome::Reply(body) = &outcome {
        if let Some(image) = session.image.as_mut() {
            if let Some(stats) = image.stats.as_mut() {
                stats.record_send(body.len(), started.elapsed());
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_and_params() {
        assert_eq!(split_command("open file \"a.dll\""), ("open", Some("file \"a.dll\"")));
        assert_eq!(split_command("headers"), ("headers", None));
        assert_eq!(split_command("exit\r\n"), ("exit", None));
    }

    #[test]
    fn command_word_is_matched_exactly_not_as_a_prefix() {
        // "opens" must not be treated as "open" with a typo'd trailing char.
        let (cmd, _) = split_command("opens file \"a.dll\"");
        assert_ne!(cmd, "open");
    }

    #[test]
    fn unknown_command_yields_405() {
        let mut session = Session::new();
        let ctx = SupportContext::init(None, Default::default(), 0x10000, false);
        match dispatch(&mut session, &ctx, "frobnicate", None) {
            DispatchOutcome::Reply(text) => assert_eq!(text, "WDEP/1.0 405 Command unknown or not allowed\r\n"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn headers_without_an_open_image_is_501() {
        let mut session = Session::new();
        match cmd_headers(&mut session) {
            DispatchOutcome::Reply(text) => assert_eq!(text, "WDEP/1.0 501 Context not allocated\r\n"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn open_without_a_file_token_is_400() {
        let mut session = Session::new();
        let ctx = SupportContext::init(None, Default::default(), 0x10000, false);
        match cmd_open(&mut session, &ctx, Some("process_relocs")) {
            DispatchOutcome::Reply(text) => assert_eq!(text, "WDEP/1.0 400 Invalid parameters received\r\n"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn knowndlls_rejects_an_unrecognised_bitness_token() {
        let ctx = SupportContext::init(None, Default::default(), 0x10000, false);
        match cmd_knowndlls(&ctx, Some("16")) {
            DispatchOutcome::Reply(text) => assert_eq!(text, "WDEP/1.0 500 Can not allocate resources\r\n"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn apisetresolve_with_no_namespace_loaded_is_500() {
        let ctx = SupportContext::init(None, Default::default(), 0x10000, false);
        match cmd_apisetresolve(&ctx, Some("api-ms-win-core-com-l2-1-1")) {
            DispatchOutcome::Reply(text) => assert_eq!(text, "WDEP/1.0 500 Can not allocate resources\r\n"),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn close_and_exit_produce_no_wire_reply() {
        let mut session = Session::new();
        let ctx = SupportContext::init(None, Default::default(), 0x10000, false);
        assert!(matches!(dispatch(&mut session, &ctx, "close", None), DispatchOutcome::NoReply));
        assert!(matches!(dispatch(&mut session, &ctx, "exit", None), DispatchOutcome::ExitSession));
    }
}
