//! Record sources
//!
//! A source hands the parser one record at a time, in file order. Sources
//! never seek: resumption is done by the parser re-reading and discarding the
//! number of records its journal says were already consumed.

use regex::Regex;
use std::io::{BufRead, Read};

use cif_common::{CifError, Result};

/// Sequential record-oriented input
pub trait RecordSource {
    /// Next record's fields, or `None` once the source is exhausted.
    ///
    /// A line that cannot be split into fields is returned as an empty
    /// record so the parser treats it as a structural mismatch.
    fn next_record(&mut self) -> Result<Option<Vec<String>>>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        (**self).next_record()
    }
}

/// Headerless CSV/TSV input
pub struct DelimitedSource<R: Read> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
}

impl<R: Read> DelimitedSource<R> {
    pub fn new(reader: R, delimiter: u8) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);

        Self {
            reader,
            record: csv::StringRecord::new(),
        }
    }

    pub fn csv(reader: R) -> Self {
        Self::new(reader, b',')
    }
}

impl<R: Read> RecordSource for DelimitedSource<R> {
    fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        match self.reader.read_record(&mut self.record) {
            Ok(true) => Ok(Some(self.record.iter().map(str::to_string).collect())),
            Ok(false) => Ok(None),
            Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => {
                tracing::warn!(error = %e, "Record is not valid UTF-8");
                Ok(Some(Vec::new()))
            },
            Err(e) => Err(CifError::Parse(format!("Failed to read delimited record: {}", e))),
        }
    }
}

/// Line-oriented input split by the capture groups of a pattern
pub struct RegexSource<R: BufRead> {
    lines: std::io::Lines<R>,
    pattern: Regex,
}

impl<R: BufRead> RegexSource<R> {
    pub fn new(reader: R, pattern: Regex) -> Self {
        Self {
            lines: reader.lines(),
            pattern,
        }
    }

    /// Number of capture groups, i.e. the field count of a matching line
    pub fn field_count(&self) -> usize {
        self.pattern.captures_len().saturating_sub(1)
    }
}

impl<R: BufRead> RecordSource for RegexSource<R> {
    fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        for line in self.lines.by_ref() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let record = match self.pattern.captures(trimmed) {
                Some(caps) => caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect(),
                None => Vec::new(),
            };
            return Ok(Some(record));
        }
        Ok(None)
    }
}

/// Records from memory, mostly for tests and replays
pub struct VecSource {
    records: std::vec::IntoIter<Vec<String>>,
}

impl VecSource {
    pub fn new<I, R, F>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = F>,
        F: Into<String>,
    {
        let records: Vec<Vec<String>> = records
            .into_iter()
            .map(|r| r.into_iter().map(Into::into).collect())
            .collect();
        Self {
            records: records.into_iter(),
        }
    }
}

impl RecordSource for VecSource {
    fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        Ok(self.records.next())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn drain(source: &mut dyn RecordSource) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_delimited_source_skips_comments_and_keeps_ragged_rows() {
        let data = "# header comment\n192.0.2.1, scanner\n\n198.51.100.7\n203.0.113.9,bot,extra\n";
        let mut source = DelimitedSource::csv(data.as_bytes());
        let records = drain(&mut source);

        assert_eq!(
            records,
            vec![
                vec!["192.0.2.1".to_string(), "scanner".to_string()],
                vec!["198.51.100.7".to_string()],
                vec!["203.0.113.9".to_string(), "bot".to_string(), "extra".to_string()],
            ]
        );
    }

    #[test]
    fn test_delimited_source_tabs() {
        let data = "example.com\tphishing\n";
        let mut source = DelimitedSource::new(data.as_bytes(), b'\t');
        assert_eq!(drain(&mut source), vec![vec!["example.com".to_string(), "phishing".to_string()]]);
    }

    #[test]
    fn test_regex_source_non_matching_line_is_empty_record() {
        let pattern = Regex::new(r"^(\S+)\s+;\s+(SBL\d+)$").unwrap();
        let data = "; Spamhaus DROP\n192.0.2.0/24 ; SBL123\ngarbage line\n";
        let mut source = RegexSource::new(data.as_bytes(), pattern);
        assert_eq!(source.field_count(), 2);

        let records = drain(&mut source);
        assert_eq!(records.len(), 3);
        assert!(records[0].is_empty());
        assert_eq!(records[1], vec!["192.0.2.0/24".to_string(), "SBL123".to_string()]);
        assert!(records[2].is_empty());
    }
}
