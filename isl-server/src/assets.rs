//! Manifest-gated static asset serving for the bundled web UI.
//!
//! Only paths listed in the manifest are ever read from disk; everything
//! else (including `/favicon.ico`) is a 404 so the server never acts as a
//! generic file server.

use std::collections::HashSet;
use std::path::PathBuf;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// Entry pages always served even without an on-disk manifest.
const DEFAULT_MANIFEST: &[&str] = &[
    "index.html",
    "platform/androidStudio.html",
    "platform/androidStudioRemote.html",
    "platform/vscode.html",
    "platform/standalone.html",
];

#[derive(Debug, Clone)]
pub struct StaticAssets {
    root: PathBuf,
    manifest: HashSet<String>,
}

impl StaticAssets {
    /// Load the manifest from `root`. A missing or unreadable manifest
    /// falls back to the built-in entry pages.
    pub fn load(root: PathBuf) -> Self {
        let manifest = match std::fs::read(root.join(MANIFEST_FILE)) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(paths) => paths.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, "malformed asset manifest, using defaults");
                    default_manifest()
                }
            },
            Err(_) => default_manifest(),
        };
        debug!(root = %root.display(), assets = manifest.len(), "assets loaded");
        Self { root, manifest }
    }

    /// Resolve the asset directory: `ISL_ASSETS_DIR`, or `isl-dist` next to
    /// the executable.
    pub fn default_root() -> PathBuf {
        if let Some(dir) = std::env::var_os("ISL_ASSETS_DIR") {
            return PathBuf::from(dir);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join("isl-dist")))
            .unwrap_or_else(|| PathBuf::from("isl-dist"))
    }

    /// Serve `path` (no leading slash; empty means the index page).
    pub async fn serve(&self, path: &str) -> Response {
        let path = if path.is_empty() { "index.html" } else { path };
        if !self.manifest.contains(path) {
            return StatusCode::NOT_FOUND.into_response();
        }
        match tokio::fs::read(self.root.join(path)).await {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type(path))],
                bytes,
            )
                .into_response(),
            Err(e) => {
                warn!(path, error = %e, "manifest asset missing on disk");
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }
}

fn default_manifest() -> HashSet<String> {
    DEFAULT_MANIFEST.iter().map(|s| (*s).to_owned()).collect()
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}
