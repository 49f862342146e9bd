//! Command-line surface, parsed with `clap`'s derive API.
//!
//! Field names and required/optional split follow
//! `original_source/src/main.cpp`'s `boost::program_options` table
//! (`jobsconfig`, `logconfig`, `max_running_time`, `loop_timeout`,
//! `status_port` required; `user`, `pid_file`, `daemonize` optional
//! ambient-process-lifecycle flags).

use clap::Parser;
use std::path::PathBuf;

/// `--version` intentionally exits 1 here, not 0 — `original_source/src/main.cpp`
/// does `std::cout << ... ; return 1;` for both `--version` and a failed
/// parse, and that quirk is preserved rather than "fixed" to the Unix
/// convention. See DESIGN.md.
#[derive(Parser, Debug)]
#[command(name = "yardmaster", disable_version_flag = true)]
pub struct Cli {
    /// Path to the jobs/pools JSON config.
    #[arg(long)]
    pub jobsconfig: PathBuf,

    /// Path to a log config file. Accepted and stored but not parsed —
    /// logging setup is an external-collaborator concern;
    /// `tracing-subscriber`'s `RUST_LOG` env filter is what actually
    /// configures verbosity. See DESIGN.md.
    #[arg(long)]
    pub logconfig: PathBuf,

    /// How long a dispatched job may run before it's considered timed out,
    /// in seconds.
    #[arg(long)]
    pub max_running_time: u64,

    /// How long to wait for a response from the JQ broker before cycling
    /// the event loop, in seconds. Drives `loop_sleep`/`hard_shutdown_wait`/
    /// `graceful_shutdown_wait`.
    #[arg(long)]
    pub loop_timeout: u64,

    /// TCP port the status server listens on.
    #[arg(long)]
    pub status_port: u16,

    /// Drop privileges to this user after binding the status port.
    #[arg(long)]
    pub user: Option<String>,

    /// Write the process id to this path after startup.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Fork, detach from the controlling terminal, and run in the
    /// background.
    #[arg(long, default_value_t = false)]
    pub daemonize: bool,

    /// Print the version and exit.
    #[arg(long, default_value_t = false)]
    pub version: bool,
}

/// Parses `args`, honoring the `--version`-exits-1 quirk before handing
/// control to `clap`'s own usage-and-exit-1 behavior for missing/invalid
/// required arguments.
pub fn parse_or_exit<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let args: Vec<std::ffi::OsString> = args.into_iter().map(Into::into).collect();
    if args.iter().skip(1).any(|a| a == "--version") {
        println!("yardmaster version: {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(1);
    }

    match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            // clap's Error::exit() prints usage and exits 2 by default; the
            // source exits 1 for any parse failure, so that's preserved here.
            eprint!("{e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        let mut v = vec!["yardmaster".to_string()];
        v.extend(extra.iter().map(|s| s.to_string()));
        v
    }

    #[test]
    fn parses_all_required_fields() {
        let cli = Cli::try_parse_from(args(&[
            "--jobsconfig", "/etc/yardmaster/jobs.json",
            "--logconfig", "/etc/yardmaster/log.xml",
            "--max_running_time", "120",
            "--loop_timeout", "10",
            "--status_port", "9000",
        ]))
        .expect("well-formed args should parse");

        assert_eq!(cli.jobsconfig, PathBuf::from("/etc/yardmaster/jobs.json"));
        assert_eq!(cli.max_running_time, 120);
        assert_eq!(cli.status_port, 9000);
        assert!(cli.user.is_none());
        assert!(!cli.daemonize);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result = Cli::try_parse_from(args(&[
            "--jobsconfig", "/etc/yardmaster/jobs.json",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn optional_ambient_flags_parse_when_present() {
        let cli = Cli::try_parse_from(args(&[
            "--jobsconfig", "/etc/yardmaster/jobs.json",
            "--logconfig", "/etc/yardmaster/log.xml",
            "--max_running_time", "120",
            "--loop_timeout", "10",
            "--status_port", "9000",
            "--user", "nobody",
            "--pid_file", "/var/run/yardmaster.pid",
            "--daemonize",
        ]))
        .unwrap();

        assert_eq!(cli.user.as_deref(), Some("nobody"));
        assert_eq!(cli.pid_file, Some(PathBuf::from("/var/run/yardmaster.pid")));
        assert!(cli.daemonize);
    }
}
