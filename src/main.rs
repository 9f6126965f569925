mod config;
mod debounce;
mod input;
mod logging;
mod process;
mod signals;
mod supervisor;
mod terminate;
mod watch;

use clap::Parser;
use config::SupervisorConfig;
use std::path::PathBuf;
use supervisor::{EventSources, Supervisor};
use tokio::sync::mpsc;

/// A Rust CLI tool that runs a script under supervision: restart it when
/// watched files change or when `rs` is typed, forward stdin to it, and take
/// its whole process tree down on SIGINT/SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "relaunch", version, about)]
pub struct Cli {
    /// Script to run under supervision
    #[arg(value_name = "SCRIPT")]
    script: PathBuf,

    /// Interpreter that runs the script
    #[arg(short = 'x', long, default_value = "node")]
    exec: String,

    /// Glob of files to watch, relative to the working directory (repeatable, replaces the defaults)
    #[arg(short, long = "watch", value_name = "GLOB")]
    watch: Vec<String>,

    /// Glob of paths to ignore (repeatable, added to the defaults)
    #[arg(short, long = "ignore", value_name = "GLOB")]
    ignore: Vec<String>,

    /// Do not watch files; restart only on `rs`
    #[arg(long)]
    no_watch: bool,

    /// Treat files that already exist at startup as a change
    #[arg(long)]
    initial: bool,

    /// Quiet period after the last change before restarting, in milliseconds
    #[arg(short, long, default_value_t = 1000, value_name = "MS")]
    delay: u64,

    /// Seconds to wait after SIGTERM before sending SIGKILL (0 waits forever)
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    stop_timeout: u64,

    /// Print resolved settings as JSON, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signals, stdin, phase transitions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    };
    // The stdin reader sits on a blocking read that would hold up runtime
    // shutdown, so leave without waiting for it.
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = SupervisorConfig::from_cli(cli)?;

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let signals = signals::install()?;

    let (input_tx, input) = mpsc::channel(64);
    input::spawn_reader(tokio::io::stdin(), input_tx);

    // Without watching, a sender that is never used keeps the branch idle.
    let (_watcher, changes, _idle) = if config.watch.enabled {
        let (watcher, changes) = watch::FileWatcher::start(&config.watch)?;
        (Some(watcher), changes, None)
    } else {
        let (tx, rx) = mpsc::channel(1);
        (None, rx, Some(tx))
    };

    let summary = Supervisor::new(&config)
        .run(EventSources {
            input,
            changes,
            signals,
        })
        .await?;
    tracing::debug!(
        restarts = summary.restarts,
        signal = ?summary.signal,
        "supervision finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_script() {
        assert!(Cli::try_parse_from(["relaunch"]).is_err());
    }

    #[test]
    fn test_cli_rejects_extra_positionals() {
        assert!(Cli::try_parse_from(["relaunch", "a.js", "b.js"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["relaunch", "server.js"]).unwrap();
        assert_eq!(cli.script, PathBuf::from("server.js"));
        assert_eq!(cli.exec, "node");
        assert_eq!(cli.delay, 1000);
        assert_eq!(cli.stop_timeout, 10);
        assert!(cli.watch.is_empty());
        assert!(!cli.no_watch && !cli.dry_run);
    }

    #[test]
    fn test_cli_repeatable_globs() {
        let cli = Cli::try_parse_from(["relaunch", "-w", "*.ts", "-w", "*.json", "app.ts"]).unwrap();
        assert_eq!(cli.watch, vec!["*.ts", "*.json"]);
    }
}
