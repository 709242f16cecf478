//! Resumable, journal-backed feed parser
//!
//! `parse` can be called repeatedly (once per scheduler tick, or in a loop
//! until the feed is exhausted) and across process restarts. Every call
//! loads the journal, continues from the recorded position, emits at most
//! `max_batch` observables that were never emitted before, and writes the
//! journal back before returning.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use cif_common::fingerprint::fingerprint;
use cif_common::{CifError, Observable, Result};

use crate::feed::FeedConfig;
use crate::journal::{JournalEntry, JournalStore};
use crate::source::RecordSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    /// Not read yet; journaled progress must be fast-forwarded first
    Fresh,
    Positioned,
    /// A read or journal write failed mid-batch; the position is unknown
    Broken,
}

pub struct ResumableParser<S: RecordSource> {
    feed: FeedConfig,
    source: S,
    journal: Arc<dyn JournalStore>,
    state: SourceState,
}

impl<S: RecordSource> ResumableParser<S> {
    pub fn new(feed: FeedConfig, source: S, journal: Arc<dyn JournalStore>) -> Self {
        Self {
            feed,
            source,
            journal,
            state: SourceState::Fresh,
        }
    }

    pub fn feed(&self) -> &FeedConfig {
        &self.feed
    }

    /// Current journal entry for this feed (a fresh one if none was saved yet)
    pub fn journal_entry(&self) -> Result<JournalEntry> {
        self.load_journal()
    }

    /// Parse up to `max_batch` new observables.
    ///
    /// Returns an empty batch once the journal says the feed is done. Errors
    /// come from the source or the journal store; after one, this parser
    /// instance refuses further calls and the source has to be reopened.
    pub fn parse(&mut self, max_batch: usize) -> Result<Vec<Observable>> {
        if self.state == SourceState::Broken {
            return Err(CifError::Parse(format!(
                "Source for feed {} failed earlier and must be reopened",
                self.feed.name
            )));
        }

        let mut journal = self.load_journal()?;
        let mut batch = Vec::new();

        if !journal.parsing {
            debug!(feed = %self.feed.name, "Feed already parsed to completion");
            return Ok(batch);
        }

        let filled = self
            .fill(&mut journal, max_batch, &mut batch)
            .and_then(|()| {
                journal.updated_at = Some(Utc::now());
                self.journal.save(&self.feed.name, &journal)
            });

        if let Err(e) = filled {
            self.state = SourceState::Broken;
            return Err(e);
        }

        info!(
            feed = %self.feed.name,
            emitted = batch.len(),
            total_objects = journal.total_objects,
            parsing = journal.parsing,
            "Parsed batch"
        );
        Ok(batch)
    }

    fn load_journal(&self) -> Result<JournalEntry> {
        let valuecount = self.feed.valuecount();
        let Some(mut journal) = self.journal.load(&self.feed.name)? else {
            return Ok(JournalEntry::new(self.feed.start, self.feed.end, valuecount));
        };

        if journal.valuecount != valuecount || journal.start != self.feed.start || journal.end != self.feed.end {
            warn!(
                feed = %self.feed.name,
                journal_valuecount = journal.valuecount,
                valuecount,
                "Feed bounds changed since the journal was written, using the feed file"
            );
            journal.valuecount = valuecount;
            journal.start = self.feed.start;
            journal.end = self.feed.end;
        }

        Ok(journal)
    }

    fn fill(&mut self, journal: &mut JournalEntry, max_batch: usize, batch: &mut Vec<Observable>) -> Result<()> {
        if self.state == SourceState::Fresh {
            self.state = SourceState::Positioned;
            if !self.fast_forward(journal)? {
                return Ok(());
            }
        }

        if journal.total_objects == 0 && journal.start > 0 && !self.skip_start(journal)? {
            return Ok(());
        }

        while batch.len() < max_batch {
            if journal.end_reached() {
                journal.parsing = false;
                break;
            }

            let Some(record) = self.source.next_record()? else {
                journal.parsing = false;
                break;
            };
            journal.consumed += 1;

            if record.len() != journal.valuecount {
                warn!(
                    feed = %self.feed.name,
                    contents = ?record,
                    values = journal.valuecount,
                    match_count = record.len(),
                    "No match"
                );
                continue;
            }

            let observable = match self.feed.build_observable(&record) {
                Ok(observable) => observable,
                Err(e) => {
                    warn!(feed = %self.feed.name, contents = ?record, error = %e, "Unusable record");
                    continue;
                },
            };

            if journal.record(fingerprint(&observable)) {
                batch.push(observable);
                journal.total_objects += 1;
            } else {
                trace!(feed = %self.feed.name, observable = %observable.value(), "Already journaled");
            }

            if journal.end_reached() {
                journal.parsing = false;
                break;
            }
        }

        Ok(())
    }

    /// Discard records a previous run already consumed. False if the source ran out.
    fn fast_forward(&mut self, journal: &mut JournalEntry) -> Result<bool> {
        if journal.consumed > 0 {
            debug!(feed = %self.feed.name, consumed = journal.consumed, "Resuming from journal");
        }
        for _ in 0..journal.consumed {
            if self.source.next_record()?.is_none() {
                journal.parsing = false;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Discard the configured `start` records. False if the source ran out.
    fn skip_start(&mut self, journal: &mut JournalEntry) -> Result<bool> {
        debug!(feed = %self.feed.name, start = journal.start, "Skipping leading records");
        for _ in 0..journal.start {
            if self.source.next_record()?.is_none() {
                journal.parsing = false;
                return Ok(false);
            }
            journal.total_objects += 1;
            journal.consumed += 1;
        }
        Ok(true)
    }
}
