//! Command line interface of the `cif-feeder` binary

use clap::Parser;
use std::path::PathBuf;

/// Parse a feed file into observables, resuming from its journal
#[derive(Parser, Debug)]
#[command(name = "cif-feeder")]
#[command(author, version, about = "CIF feed parser")]
pub struct Cli {
    /// Feed definition (TOML)
    #[arg(short, long, env = "CIF_FEED")]
    pub feed: PathBuf,

    /// Raw feed data to parse
    #[arg(short = 'i', long)]
    pub file: PathBuf,

    /// Directory holding one journal per feed
    #[arg(short, long, env = "CIF_JOURNAL_DIR", default_value = "./journals")]
    pub journal_dir: PathBuf,

    /// Maximum observables emitted per batch
    #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch: u32,

    /// Append observables as JSON lines to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Keep the journal in memory only
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_batch_must_be_positive() {
        let parsed = Cli::try_parse_from(["cif-feeder", "-f", "feed.toml", "-i", "data.csv", "-b", "0"]);
        assert!(parsed.is_err());
    }
}
