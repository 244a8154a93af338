//! The launcher: decide whether to spawn a fresh server, reuse a running
//! one, or kill it, then hand the user a URL.

use std::process::Stdio;
use std::time::Duration;

use isl_core::serverdir::{generate_token, tokens_equal};
use isl_core::ServerDir;
use isl_model::{Platform, ServerRecord};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::child::{
    ChildMessage, ChildResult, StartServerArgs, SERVER_ARGS_ENV,
};
use crate::cli::Args;
use crate::server::{self, StartServerResult};

/// Challenge round-trips are local; anything slower is not our server.
const CHALLENGE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for a spawned child's result line.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonOutput<'a> {
    port: u16,
    url: &'a str,
    token: &'a str,
    pid: u32,
    was_server_reused: bool,
    log_file_location: &'a str,
    cwd: &'a str,
    command: &'a str,
}

enum StartOutcome {
    Running {
        pid: u32,
        /// Present in foreground mode; awaited after printing the URL.
        serve: Option<tokio::task::JoinHandle<()>>,
    },
    AddressInUse,
    Failed(String),
}

pub async fn run(args: Args) -> i32 {
    let platform = match args.platform.as_deref() {
        None => Platform::Browser,
        Some(name) => match Platform::parse(name) {
            Some(platform) => platform,
            None => return fail(&args, format!("unknown platform '{name}'")),
        },
    };
    let server_dir = match ServerDir::user_default() {
        Ok(dir) => dir,
        Err(e) => return fail(&args, format!("cannot locate state dir: {e}")),
    };
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd.display().to_string(),
        Err(e) => return fail(&args, format!("cannot read cwd: {e}")),
    };

    if args.kill {
        return match kill_server(&server_dir, args.port).await {
            Ok(()) => {
                if !args.json {
                    println!("killed server on port {}", args.port);
                }
                0
            }
            Err(e) => fail(&args, format!("could not kill server: {e}")),
        };
    }
    if args.force {
        match kill_server(&server_dir, args.port).await {
            Ok(()) => {
                debug!("killed existing server before fresh spawn");
                // Let the old server release the port before rebinding.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => debug!(error = %e, "no server to kill before fresh spawn"),
        }
    }

    let mut reuse_allowed = !args.force;
    loop {
        let log_file_location = if args.stdout {
            "stdout".to_owned()
        } else {
            match scratch_log_path() {
                Ok(path) => path,
                Err(e) => {
                    return fail(&args, format!("cannot create log dir: {e}"));
                }
            }
        };
        let start_args = StartServerArgs {
            port: args.port,
            sensitive_token: generate_token(),
            challenge_token: generate_token(),
            log_file_location,
            command: args.command.clone(),
            sl_version: args.sl_version.clone(),
            foreground: args.foreground(),
        };

        let outcome = if args.foreground() {
            crate::child::init_logging(&start_args.log_file_location);
            match server::start_server(&start_args).await {
                StartServerResult::Started { serve, .. } => {
                    StartOutcome::Running {
                        pid: std::process::id(),
                        serve: Some(serve),
                    }
                }
                StartServerResult::AddressInUse => StartOutcome::AddressInUse,
                StartServerResult::NeedsElevatedPrivileges => {
                    StartOutcome::Failed(format!(
                        "binding port {} needs elevated privileges",
                        args.port
                    ))
                }
                StartServerResult::Error(e) => StartOutcome::Failed(e),
            }
        } else {
            match spawn_background(&start_args).await {
                Ok(outcome) => outcome,
                Err(e) => StartOutcome::Failed(e),
            }
        };

        match outcome {
            StartOutcome::Running { pid, serve } => {
                let record = ServerRecord {
                    sensitive_token: start_args.sensitive_token.clone(),
                    challenge_token: start_args.challenge_token.clone(),
                    log_file_location: start_args.log_file_location.clone(),
                    command: start_args.command.clone(),
                    tool_version: start_args.sl_version.clone(),
                };
                if let Err(e) = server_dir.write(args.port, &record).await {
                    return fail(&args, format!("cannot write server record: {e}"));
                }
                let url = match build_url(
                    args.port,
                    args.dev,
                    platform,
                    &record.sensitive_token,
                    &cwd,
                ) {
                    Ok(url) => url,
                    Err(e) => return fail(&args, e),
                };
                emit_success(
                    &args,
                    JsonOutput {
                        port: args.port,
                        url: &url,
                        token: &record.sensitive_token,
                        pid,
                        was_server_reused: false,
                        log_file_location: &record.log_file_location,
                        cwd: &cwd,
                        command: &args.command,
                    },
                );
                maybe_open(&args, &url);
                if let Some(serve) = serve {
                    let _ = serve.await;
                }
                return 0;
            }
            StartOutcome::AddressInUse if reuse_allowed => {
                match try_reuse(&server_dir, &args).await {
                    Ok(ReuseOutcome::Reused { record, pid }) => {
                        let url = match build_url(
                            args.port,
                            args.dev,
                            platform,
                            &record.sensitive_token,
                            &cwd,
                        ) {
                            Ok(url) => url,
                            Err(e) => return fail(&args, e),
                        };
                        emit_success(
                            &args,
                            JsonOutput {
                                port: args.port,
                                url: &url,
                                token: &record.sensitive_token,
                                pid,
                                was_server_reused: true,
                                log_file_location: &record.log_file_location,
                                cwd: &cwd,
                                command: &args.command,
                            },
                        );
                        maybe_open(&args, &url);
                        return 0;
                    }
                    Ok(ReuseOutcome::VersionDrift) => {
                        // Stale server: kill it and start over, once.
                        if let Err(e) =
                            kill_server(&server_dir, args.port).await
                        {
                            return fail(
                                &args,
                                format!("cannot replace stale server: {e}"),
                            );
                        }
                        // Give the old server a moment to release the port.
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        reuse_allowed = false;
                        continue;
                    }
                    Err(message) => return fail(&args, message),
                }
            }
            StartOutcome::AddressInUse => {
                return fail(
                    &args,
                    format!("port {} is in use and not reusable", args.port),
                );
            }
            StartOutcome::Failed(message) => return fail(&args, message),
        }
    }
}

enum ReuseOutcome {
    Reused { record: ServerRecord, pid: u32 },
    VersionDrift,
}

async fn try_reuse(
    server_dir: &ServerDir,
    args: &Args,
) -> Result<ReuseOutcome, String> {
    let record = server_dir
        .read_with_retries(args.port)
        .await
        .map_err(|_| {
            format!("port {} is in use by an unknown process", args.port)
        })?;
    let pid = challenge_server(args.port, &record).await.ok_or(format!(
        "port {} is in use, but it is not a reusable server",
        args.port
    ))?;
    if record.command != args.command || record.tool_version != args.sl_version
    {
        debug!(
            running = %record.tool_version,
            requested = %args.sl_version,
            "server drifted from requested command/version"
        );
        return Ok(ReuseOutcome::VersionDrift);
    }
    Ok(ReuseOutcome::Reused { record, pid })
}

/// Ask the suspect server to prove itself: present the sensitive token, get
/// back the challenge token and its pid. Both comparisons are timing-safe.
pub(crate) async fn challenge_server(
    port: u16,
    record: &ServerRecord,
) -> Option<u32> {
    let client = reqwest::Client::builder()
        .timeout(CHALLENGE_TIMEOUT)
        .build()
        .ok()?;
    let url = format!(
        "http://localhost:{port}/challenge_authenticity?token={}",
        urlencode(&record.sensitive_token)
    );
    let response = client.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let challenge: isl_model::ChallengeResponse =
        response.json().await.ok()?;
    tokens_equal(&challenge.challenge_token, &record.challenge_token)
        .then_some(challenge.pid)
}

/// Kill protocol: challenge for the pid, send the terminate signal, drop
/// the record. A signal failure (process already gone) is reported but does
/// not fail the kill.
async fn kill_server(server_dir: &ServerDir, port: u16) -> Result<(), String> {
    let record = server_dir
        .read_with_retries(port)
        .await
        .map_err(|e| format!("no reusable server on port {port}: {e}"))?;
    let pid = challenge_server(port, &record)
        .await
        .ok_or_else(|| format!("server on port {port} failed the challenge"))?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "did-not-kill: terminate signal failed");
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "did-not-kill: unsupported platform");
    }

    let _ = server_dir.delete(port).await;
    Ok(())
}

/// Spawn this executable as a detached background server and wait for its
/// handshake result.
async fn spawn_background(
    start_args: &StartServerArgs,
) -> Result<StartOutcome, String> {
    let exe = std::env::current_exe()
        .map_err(|e| format!("cannot find own executable: {e}"))?;
    let json = serde_json::to_string(start_args)
        .map_err(|e| format!("cannot serialize server args: {e}"))?;

    let mut cmd = tokio::process::Command::new(exe);
    cmd.env(SERVER_ARGS_ENV, json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);
    let mut spawned = cmd
        .spawn()
        .map_err(|e| format!("cannot spawn server: {e}"))?;
    let pid = spawned.id().unwrap_or_default();
    let stdout = spawned
        .stdout
        .take()
        .ok_or_else(|| "child stdout was not piped".to_owned())?;

    let result = tokio::time::timeout(SPAWN_TIMEOUT, async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<ChildMessage>(&line) {
                Ok(ChildMessage::Message { message }) => {
                    debug!(%message, "server");
                }
                Ok(ChildMessage::Result { result }) => return Some(result),
                Err(_) => debug!(%line, "unstructured server output"),
            }
        }
        None
    })
    .await
    .map_err(|_| "server did not report a result in time".to_owned())?
    .ok_or_else(|| "server exited without reporting a result".to_owned())?;

    match result {
        ChildResult::Success => Ok(StartOutcome::Running { pid, serve: None }),
        ChildResult::AddressInUse => Ok(StartOutcome::AddressInUse),
        ChildResult::NeedsElevatedPrivileges => Ok(StartOutcome::Failed(
            "binding the port needs elevated privileges".to_owned(),
        )),
        ChildResult::Error { message } => Ok(StartOutcome::Failed(message)),
    }
}

/// `http://localhost:<servingPort>/<platformPath>?token=…&cwd=…`; a URL
/// containing spaces is a construction bug, not something to pass along.
pub(crate) fn build_url(
    port: u16,
    dev: bool,
    platform: Platform,
    token: &str,
    cwd: &str,
) -> Result<String, String> {
    let serving_port = if dev { 3000 } else { port };
    let url = format!(
        "http://localhost:{serving_port}/{}?token={}&cwd={}",
        platform.url_path(),
        urlencode(token),
        urlencode(cwd)
    );
    if url.contains(' ') {
        return Err(format!("illegal URL containing spaces: {url}"));
    }
    Ok(url)
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn scratch_log_path() -> std::io::Result<String> {
    let dir = tempfile::Builder::new()
        .prefix("isl-server-log")
        .tempdir()?
        .keep();
    Ok(dir.join("isl-server.log").display().to_string())
}

fn emit_success(args: &Args, output: JsonOutput<'_>) {
    if args.json {
        if let Ok(json) = serde_json::to_string(&output) {
            println!("{json}");
        }
        return;
    }
    if output.was_server_reused {
        println!("reusing server on port {}", output.port);
    } else {
        println!("started server on port {}", output.port);
    }
    println!("{}", output.url);
    println!("logs: {}", output.log_file_location);
}

fn fail(args: &Args, message: String) -> i32 {
    if args.json {
        let body = serde_json::json!({ "error": message });
        println!("{body}");
    } else {
        eprintln!("{message}");
    }
    1
}

fn maybe_open(args: &Args, url: &str) {
    if args.no_open {
        return;
    }
    if let Err(e) = webbrowser::open(url) {
        warn!(error = %e, "could not open browser");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_contains_both_query_params() {
        let url = build_url(
            3011,
            false,
            Platform::Browser,
            "deadbeef",
            "/home/user/repo",
        )
        .unwrap();
        assert!(url.starts_with("http://localhost:3011/?token=deadbeef"));
        assert!(url.contains("cwd=%2Fhome%2Fuser%2Frepo"));
    }

    #[test]
    fn dev_mode_builds_for_port_3000() {
        let url =
            build_url(3011, true, Platform::Browser, "t", "/r").unwrap();
        assert!(url.starts_with("http://localhost:3000/"));
    }

    #[test]
    fn platform_pages_have_paths() {
        let url = build_url(
            3011,
            false,
            Platform::AndroidStudio,
            "t",
            "/r",
        )
        .unwrap();
        assert!(url.contains("/platform/androidStudio.html?"));
    }

    #[test]
    fn spaces_are_encoded_not_fatal() {
        let url = build_url(
            3011,
            false,
            Platform::Browser,
            "t",
            "/home/user/my repo",
        )
        .unwrap();
        assert!(!url.contains(' '));
        assert!(url.contains("my+repo"));
    }
}
