//! # run-proxy
//!
//! Launcher and server for Interactive Smartlog: a local HTTP + WebSocket
//! server that sits between the browser UI and the `sl` command line tool.
//!
//! One binary plays both roles. Invoked normally it is the launcher: it
//! decides whether to spawn a fresh background server, reuse a running one
//! after a challenge round-trip, or kill it, and prints the URL (or a JSON
//! summary) for the user. Invoked with `ISL_SERVER_ARGS` in the environment
//! it is the background server child.

use clap::Parser;
use isl_server::{child, cli, launcher};

#[tokio::main]
async fn main() {
    // Child mode is decided by the environment, before any CLI parsing, so
    // the child never argues with the launcher's argv.
    if let Some(parsed) = child::server_args_from_env() {
        let code = match parsed {
            Ok(args) => child::run_child(args).await,
            Err(e) => {
                eprintln!("invalid {}: {e}", child::SERVER_ARGS_ENV);
                1
            }
        };
        std::process::exit(code);
    }

    let args = cli::Args::parse();
    let code = launcher::run(args).await;
    std::process::exit(code);
}
