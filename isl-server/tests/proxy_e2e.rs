//! End-to-end launcher scenarios against the real `run-proxy` binary:
//! fresh spawn, reuse, kill, and version drift. The per-user state dir is
//! redirected into a scratch directory via `XDG_CACHE_HOME`, so these only
//! run where that override is honored.
#![cfg(target_os = "linux")]

use std::process::Command;

struct Proxy {
    state_dir: tempfile::TempDir,
    port: u16,
}

impl Proxy {
    fn new(port_offset: u16) -> Self {
        Self {
            state_dir: tempfile::tempdir().unwrap(),
            // Spread ports across test processes and test cases.
            port: 21000
                + (std::process::id() % 10000) as u16
                + port_offset,
        }
    }

    fn run(&self, extra: &[&str]) -> std::process::Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_run-proxy"));
        cmd.arg("--json")
            .arg("--no-open")
            .arg("-p")
            .arg(self.port.to_string())
            .args(extra)
            .env("XDG_CACHE_HOME", self.state_dir.path());
        cmd.output().expect("run-proxy did not execute")
    }

    fn run_json(&self, extra: &[&str]) -> serde_json::Value {
        let output = self.run(extra);
        assert!(
            output.status.success(),
            "run-proxy failed: {}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        serde_json::from_slice(&output.stdout).expect("bad JSON output")
    }

    fn kill(&self) {
        let _ = self.run(&["--kill"]);
    }
}

#[test]
fn fresh_spawn_then_reuse_then_kill() {
    let proxy = Proxy::new(0);

    // S1: fresh spawn.
    let first = proxy.run_json(&[]);
    assert_eq!(first["wasServerReused"], false);
    assert_eq!(first["port"], proxy.port);
    let token = first["token"].as_str().unwrap();
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    let url = first["url"].as_str().unwrap();
    assert!(url.starts_with(&format!("http://localhost:{}/", proxy.port)));
    let pid = first["pid"].as_u64().unwrap();
    assert!(pid > 0);

    // S2: same args reuse the same server, token and all.
    let second = proxy.run_json(&[]);
    assert_eq!(second["wasServerReused"], true);
    assert_eq!(second["pid"], pid);
    assert_eq!(second["token"], token);

    // S3: kill succeeds and removes the record, so a second kill fails.
    let kill = proxy.run(&["--kill"]);
    assert!(kill.status.success());
    let rekill = proxy.run(&["--kill"]);
    assert!(!rekill.status.success());
}

#[test]
fn version_drift_forces_a_fresh_server() {
    let proxy = Proxy::new(100);

    let first = proxy.run_json(&["--sl-version", "0.1"]);
    let first_pid = first["pid"].as_u64().unwrap();

    // S5: a different reported tool version kills and respawns.
    let second = proxy.run_json(&["--sl-version", "0.2"]);
    assert_eq!(second["wasServerReused"], false);
    assert_ne!(second["pid"].as_u64().unwrap(), first_pid);

    // The replacement is reusable under the new version.
    let third = proxy.run_json(&["--sl-version", "0.2"]);
    assert_eq!(third["wasServerReused"], true);

    proxy.kill();
}

#[test]
fn force_always_spawns_fresh() {
    let proxy = Proxy::new(200);

    let first = proxy.run_json(&[]);
    let first_pid = first["pid"].as_u64().unwrap();

    // S4: --force kills the healthy server and starts another.
    let second = proxy.run_json(&["--force"]);
    assert_eq!(second["wasServerReused"], false);
    assert_ne!(second["pid"].as_u64().unwrap(), first_pid);

    proxy.kill();
}

#[test]
fn unknown_platform_is_a_config_error() {
    let proxy = Proxy::new(300);
    let output = proxy.run(&["--platform", "flipphone"]);
    assert!(!output.status.success());
    let body: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap();
    assert!(body["error"].as_str().unwrap().contains("flipphone"));
}
