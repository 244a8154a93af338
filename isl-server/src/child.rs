//! Background-server child mode.
//!
//! The launcher re-executes this binary with `ISL_SERVER_ARGS` set; the
//! child binds the port, reports exactly one `result` line on stdout, and
//! then lives on detached with its logging in the designated file. The
//! parent stops reading after the result, so nothing else may ever be
//! printed to stdout.

use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::{self, StartServerResult};

pub const SERVER_ARGS_ENV: &str = "ISL_SERVER_ARGS";

/// Everything a server instance needs, passed from the launcher through the
/// (user-private) process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartServerArgs {
    pub port: u16,
    pub sensitive_token: String,
    pub challenge_token: String,
    /// Absolute path, or the literal `"stdout"`.
    pub log_file_location: String,
    pub command: String,
    pub sl_version: String,
    pub foreground: bool,
}

/// Structured lines the child posts to its parent during the handshake.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChildMessage {
    Message { message: String },
    Result { result: ChildResult },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChildResult {
    Success,
    AddressInUse,
    NeedsElevatedPrivileges,
    Error { message: String },
}

/// Detect child mode. `None` means this process is the launcher.
pub fn server_args_from_env() -> Option<anyhow::Result<StartServerArgs>> {
    let raw = std::env::var(SERVER_ARGS_ENV).ok()?;
    Some(serde_json::from_str(&raw).map_err(Into::into))
}

pub async fn run_child(args: StartServerArgs) -> i32 {
    init_logging(&args.log_file_location);
    install_panic_hook(args.log_file_location.clone());
    post(&ChildMessage::Message {
        message: format!("starting server on port {}", args.port),
    });

    match server::start_server(&args).await {
        StartServerResult::Started { serve, .. } => {
            post(&ChildMessage::Result {
                result: ChildResult::Success,
            });
            // Serve until a signal or idle shutdown exits the process.
            let _ = serve.await;
            0
        }
        StartServerResult::AddressInUse => {
            post(&ChildMessage::Result {
                result: ChildResult::AddressInUse,
            });
            1
        }
        StartServerResult::NeedsElevatedPrivileges => {
            post(&ChildMessage::Result {
                result: ChildResult::NeedsElevatedPrivileges,
            });
            1
        }
        StartServerResult::Error(message) => {
            post(&ChildMessage::Result {
                result: ChildResult::Error { message },
            });
            1
        }
    }
}

fn post(message: &ChildMessage) {
    if let Ok(json) = serde_json::to_string(message) {
        let mut stdout = std::io::stdout();
        let _ = writeln!(stdout, "{json}");
        let _ = stdout.flush();
    }
}

/// Route tracing to the chosen sink. `try_init` so a second call (e.g. the
/// foreground path re-entering after version drift) is harmless.
pub fn init_logging(location: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "isl_server=info,isl_core=info".into());
    if location == "stdout" {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        return;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(location)
    {
        Ok(file) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init();
        }
    }
}

/// Append panic traces to the log file before dying, so crashes of a
/// detached server are diagnosable.
fn install_panic_hook(location: String) {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if location != "stdout" {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&location)
            {
                let _ = writeln!(file, "[panic] {info}");
            }
        }
        original(info);
        std::process::exit(1);
    }));
}
