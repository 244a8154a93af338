use clap::Parser;

/// Command line arguments for the `run-proxy` launcher.
///
/// `--stdout` implies `--foreground`: logging to the launcher's stdout only
/// makes sense while the server shares its process.
#[derive(Parser, Debug, Clone)]
#[command(name = "run-proxy")]
#[command(about = "Launch or reuse a local Interactive Smartlog server")]
pub struct Args {
    /// Run the server in this process instead of a background child
    #[arg(short, long)]
    pub foreground: bool,

    /// Do not launch the default browser after starting
    #[arg(long = "no-open")]
    pub no_open: bool,

    /// Port to bind
    #[arg(short, long, env = "PORT", default_value_t = 3011)]
    pub port: u16,

    /// Emit one JSON object on stdout and suppress human prose
    #[arg(long)]
    pub json: bool,

    /// Log to stdout (implies --foreground)
    #[arg(long)]
    pub stdout: bool,

    /// Build the URL as if served by the dev server on port 3000
    #[arg(long)]
    pub dev: bool,

    /// Kill any reusable server on the port, then exit
    #[arg(long)]
    pub kill: bool,

    /// Kill any reusable server on the port, then spawn fresh
    #[arg(long)]
    pub force: bool,

    /// Source-control command to run
    #[arg(long, default_value = "sl")]
    pub command: String,

    /// Reported tool version; a mismatch with a running server forces a
    /// fresh spawn
    #[arg(long = "sl-version", default_value = "(dev)")]
    pub sl_version: String,

    /// UI platform (browser, androidStudio, androidStudioRemote, vscode,
    /// standalone)
    #[arg(long)]
    pub platform: Option<String>,
}

impl Args {
    pub fn foreground(&self) -> bool {
        self.foreground || self.stdout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_flags() {
        let args = Args::parse_from(["run-proxy"]);
        assert_eq!(args.port, 3011);
        assert_eq!(args.command, "sl");
        assert!(!args.foreground());
    }

    #[test]
    fn stdout_implies_foreground() {
        let args = Args::parse_from(["run-proxy", "--stdout"]);
        assert!(args.foreground());
    }

    #[test]
    fn short_flags_parse() {
        let args =
            Args::parse_from(["run-proxy", "-f", "-p", "4000", "--json"]);
        assert!(args.foreground);
        assert_eq!(args.port, 4000);
        assert!(args.json);
    }
}
