//! Resumable parser behaviour across batches, bounds and restarts

use cif_common::fingerprint::fingerprint;
use cif_common::{Observable, ObservableType};
use cif_feeder::{
    DelimitedSource, FeedConfig, FeedDefaults, FeedFormat, FileJournalStore, JournalStore,
    MemoryJournalStore, ResumableParser, VecSource,
};
use std::collections::HashSet;
use std::sync::Arc;

fn feed(start: u64, end: Option<u64>) -> FeedConfig {
    FeedConfig {
        name: "test-feed".to_string(),
        format: FeedFormat::Csv,
        pattern: None,
        values: vec!["observable".to_string(), "description".to_string()],
        start,
        end,
        defaults: FeedDefaults {
            otype: Some(ObservableType::Fqdn),
            ..Default::default()
        },
    }
}

fn numbered(n: usize) -> VecSource {
    VecSource::new((1..=n).map(|i| vec![format!("host{}.example", i), format!("record {}", i)]))
}

fn values(batch: &[Observable]) -> Vec<String> {
    batch.iter().map(|o| o.value().to_string()).collect()
}

#[test]
fn test_start_skips_leading_records() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let mut parser = ResumableParser::new(feed(3, None), numbered(6), store);

    let batch = parser.parse(1).unwrap();
    assert_eq!(values(&batch), vec!["host4.example"]);

    let journal = parser.journal_entry().unwrap();
    assert_eq!(journal.total_objects, 4, "3 skipped + 1 emitted");
}

#[test]
fn test_start_beyond_source_exhausts_without_output() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let mut parser = ResumableParser::new(feed(10, None), numbered(4), store);

    assert!(parser.parse(100).unwrap().is_empty());
    let journal = parser.journal_entry().unwrap();
    assert!(!journal.parsing);
    assert_eq!(journal.total_objects, 4);
}

#[test]
fn test_end_bound_stops_mid_batch() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let mut parser = ResumableParser::new(feed(2, Some(5)), numbered(20), store);

    let batch = parser.parse(100).unwrap();
    assert_eq!(values(&batch), vec!["host3.example", "host4.example", "host5.example"]);

    let journal = parser.journal_entry().unwrap();
    assert_eq!(journal.total_objects, 5);
    assert!(!journal.parsing);
    assert!(parser.parse(100).unwrap().is_empty());
}

#[test]
fn test_end_not_above_start_emits_nothing() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let mut parser = ResumableParser::new(feed(4, Some(4)), numbered(10), store);

    assert!(parser.parse(10).unwrap().is_empty());
    let journal = parser.journal_entry().unwrap();
    assert_eq!(journal.total_objects, 4);
    assert!(!journal.parsing);
}

#[test]
fn test_structural_mismatch_never_counts() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let source = VecSource::new(vec![
        vec!["a.example", "ok"],
        vec!["b.example"],
        vec!["c.example", "too", "many"],
        vec!["", "blank observable"],
        vec!["d.example", "ok"],
    ]);
    let mut parser = ResumableParser::new(feed(0, None), source, store);

    let batch = parser.parse(10).unwrap();
    assert_eq!(values(&batch), vec!["a.example", "d.example"]);

    let journal = parser.journal_entry().unwrap();
    assert_eq!(journal.total_objects, 2);
    assert_eq!(journal.consumed, 5);
    assert!(!journal.parsing);
}

#[test]
fn test_duplicates_within_source_are_emitted_once() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let source = VecSource::new(vec![
        vec!["a.example", "first"],
        vec!["a.example", "again"],
        vec!["b.example", "x"],
    ]);
    let mut parser = ResumableParser::new(feed(0, None), source, store);

    let batch = parser.parse(2).unwrap();
    assert_eq!(values(&batch), vec!["a.example", "b.example"]);
    assert_eq!(batch[0].description.as_deref(), Some("first"));
    assert_eq!(parser.journal_entry().unwrap().total_objects, 2);
}

#[test]
fn test_restart_resumes_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let data = "# test feed\na.example,1\nb.example,2\nc.example,3\nd.example,4\ne.example,5\n";

    let store: Arc<dyn JournalStore> = Arc::new(FileJournalStore::new(dir.path()).unwrap());
    let mut first_run = ResumableParser::new(feed(1, None), DelimitedSource::csv(data.as_bytes()), store);
    let first = first_run.parse(2).unwrap();
    drop(first_run);

    // New process: new store handle, source reopened from the beginning
    let store: Arc<dyn JournalStore> = Arc::new(FileJournalStore::new(dir.path()).unwrap());
    let mut second_run = ResumableParser::new(feed(1, None), DelimitedSource::csv(data.as_bytes()), store);
    let second = second_run.parse(10).unwrap();

    assert_eq!(values(&first), vec!["b.example", "c.example"]);
    assert_eq!(values(&second), vec!["d.example", "e.example"]);

    let fingerprints: HashSet<String> = first.iter().chain(&second).map(fingerprint).collect();
    assert_eq!(fingerprints.len(), first.len() + second.len());

    let journal = second_run.journal_entry().unwrap();
    assert_eq!(journal.total_objects, 5);
    assert!(!journal.parsing);
}

#[test]
fn test_changed_source_only_emits_new_observables() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn JournalStore> = Arc::new(FileJournalStore::new(dir.path()).unwrap());

    let mut parser = ResumableParser::new(feed(0, None), numbered(3), store.clone());
    assert_eq!(parser.parse(10).unwrap().len(), 3);

    // Journal is finished for this source; reset the run state to re-feed it
    let mut journal = store.load("test-feed").unwrap().unwrap();
    journal.parsing = true;
    journal.consumed = 0;
    store.save("test-feed", &journal).unwrap();

    let mut parser = ResumableParser::new(feed(0, None), numbered(5), store);
    let batch = parser.parse(10).unwrap();
    assert_eq!(values(&batch), vec!["host4.example", "host5.example"]);
}

#[test]
fn test_finished_source_is_not_reopened() {
    let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
    let mut parser = ResumableParser::new(feed(0, None), numbered(2), store.clone());
    assert_eq!(parser.parse(10).unwrap().len(), 2);

    let mut parser = ResumableParser::new(feed(0, None), numbered(8), store);
    assert!(parser.parse(10).unwrap().is_empty());
}
