//! CIF Feeder - feed parsing tool

use anyhow::{Context, Result};
use cif_common::logging::{init_logging, LogConfig, LogLevel};
use cif_feeder::cli::Cli;
use cif_feeder::{FeedConfig, FileJournalStore, JournalStore, MemoryJournalStore, ResumableParser};
use clap::Parser;
use serde_jsonlines::JsonLinesWriter;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::sync::Arc;
use tracing::info;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cif-feeder")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let feed = FeedConfig::from_file(&cli.feed)
        .with_context(|| format!("Failed to load feed {}", cli.feed.display()))?;

    let journal: Arc<dyn JournalStore> = if cli.dry_run {
        Arc::new(MemoryJournalStore::new())
    } else {
        Arc::new(FileJournalStore::new(&cli.journal_dir).context("Failed to open journal directory")?)
    };

    let data = File::open(&cli.file)
        .with_context(|| format!("Failed to open {}", cli.file.display()))?;
    let source = feed.open(BufReader::new(data))?;

    let out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open output {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = JsonLinesWriter::new(out);

    info!(feed = %feed.name, file = %cli.file.display(), "Parsing feed");
    let mut parser = ResumableParser::new(feed, source, journal);
    let mut emitted = 0usize;

    loop {
        let batch = parser.parse(cli.batch as usize)?;
        emitted += batch.len();
        writer.write_all(&batch).context("Failed to write observables")?;
        writer.flush()?;

        if !parser.journal_entry()?.parsing {
            break;
        }
    }

    info!(feed = %parser.feed().name, emitted, "Feed parsed");
    Ok(())
}
