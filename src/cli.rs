use crate::daemon::{DaemonArgs, daemon};
use crate::milter::Milter;
use clap::Parser;
use log::LevelFilter;
use std::error::Error;

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Serve milter connections
    Daemon(DaemonArgs),
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    #[cfg(feature = "systemd")]
    if std::env::var_os("JOURNAL_STREAM").is_some() && systemd::journal::JournalLog::init().is_ok()
    {
        log::set_max_level(level);
        return;
    }

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Command line entry point for a filter binary.
pub fn cli<M, F>(factory: F) -> Result<(), Box<dyn Error>>
where
    M: Milter + 'static,
    F: Fn() -> (M, u32, u32) + Send + Sync + 'static,
{
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::Daemon(args) => daemon(&args, factory),
    }
}

#[test]
fn test_parse_daemon_args() {
    let cli = Cli::try_parse_from(["milterd", "-v", "daemon", "--max-sessions", "8"]).unwrap();
    assert!(cli.verbose);
    let Command::Daemon(args) = cli.command;
    assert_eq!(args.address, "127.0.0.1:7044");
    assert_eq!(args.unix, None);
    assert_eq!(args.max_sessions, 8);
    assert_eq!(args.poll_ms, 100);

    let cli = Cli::try_parse_from(["milterd", "daemon", "--unix", "/run/milterd.sock"]).unwrap();
    let Command::Daemon(args) = cli.command;
    assert_eq!(args.unix.as_deref(), Some(std::path::Path::new("/run/milterd.sock")));
}
