//! CIF Feeder Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns raw feed files into observables without re-emitting data that was
//! already handled.
//!
//! # Components
//!
//! - **Feeds**: TOML feed definitions mapping record columns to observable fields
//! - **Sources**: CSV/TSV and regex record readers
//! - **Journals**: per-feed progress and emitted fingerprints
//! - **Parser**: the resumable, batch-bounded parse loop
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use std::sync::Arc;
//! use cif_feeder::{FeedConfig, FileJournalStore, ResumableParser};
//!
//! fn main() -> anyhow::Result<()> {
//!     let feed = FeedConfig::from_file("feeds/blocklist-de.toml")?;
//!     let source = feed.open(BufReader::new(File::open("data/blocklist-de.txt")?))?;
//!     let journal = Arc::new(FileJournalStore::new("./journals")?);
//!
//!     let mut parser = ResumableParser::new(feed, source, journal);
//!     let batch = parser.parse(1000)?;
//!     println!("{} new observables", batch.len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod feed;
pub mod journal;
pub mod parser;
pub mod source;

pub use feed::{FeedConfig, FeedDefaults, FeedFormat};
pub use journal::{FileJournalStore, JournalEntry, JournalStore, MemoryJournalStore};
pub use parser::ResumableParser;
pub use source::{DelimitedSource, RecordSource, RegexSource, VecSource};
