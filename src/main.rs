use std::process::exit;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tracing::Level;

use nb::error::Error;
use nb::ui;

/// An incremental, deduplicating backup tool.
///
/// Running with just a repository takes a backup of whatever its config
/// selects. `gc` sweeps unreferenced objects, `integrity` re-checks
/// stored data, and a backup id (with an optional path) restores.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The repository to operate on
    repository: Utf8PathBuf,

    /// gc | integrity | <backup id> [path]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);

    if let Err(e) = run(&args) {
        eprintln!("nb: {e:#}");
        exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let repository = &args.repository;
    match args.command.as_slice() {
        [] => ui::backup::run(repository),
        [one] if one == "gc" => ui::gc::run(repository),
        [one] if one == "integrity" => ui::integrity::run(repository),
        [id] => ui::restore::run(repository, parse_id(id)?, Utf8Path::new("/")),
        [id, path] => ui::restore::run(repository, parse_id(id)?, Utf8Path::new(path)),
        _ => Err(Error::InvalidArgument.into()),
    }
}

fn parse_id(id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| anyhow::Error::from(Error::InvalidArgument))
}

/// Set up tracing to spit messages to stderr.
fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
