mod auth;
mod calc;
mod db;
mod error;
mod ipc;
mod session;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

fn init_tracing() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("ATTENDD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os("ATTENDD_WORKSPACE").map(PathBuf::from) {
        // A bad startup workspace is not fatal; the host can still select one.
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            tracing::error!(
                workspace = %path.display(),
                error = %e,
                "failed to open startup workspace"
            );
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "attendd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // No id to echo back.
                tracing::warn!(error = %e, "malformed request line");
                serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}
