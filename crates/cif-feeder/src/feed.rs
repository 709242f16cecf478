//! Feed definitions
//!
//! A feed file (TOML) names the source, describes how to split it into
//! records, and maps each record column onto an observable field:
//!
//! ```toml
//! name = "blocklist-de-ssh"
//! format = "csv"
//! values = ["observable", "description"]
//! start = 0
//!
//! [defaults]
//! otype = "ipv4"
//! tags = ["scanner", "ssh"]
//! confidence = 85
//! provider = "blocklist.de"
//! ```

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

use cif_common::{CifError, Observable, ObservableType, Result};

use crate::source::{DelimitedSource, RecordSource, RegexSource};

/// Column name that is read but not mapped
pub const IGNORED_COLUMN: &str = "_";

const KNOWN_FIELDS: &[&str] = &[
    "observable",
    "otype",
    "confidence",
    "tags",
    "tlp",
    "provider",
    "group",
    "description",
    "application",
    "protocol",
    "portlist",
    "asn",
    "cc",
    "firsttime",
    "lasttime",
    "reporttime",
    IGNORED_COLUMN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Csv,
    Tsv,
    Regex,
}

/// Values applied to every observable of a feed before column mapping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedDefaults {
    pub otype: Option<ObservableType>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: Option<u8>,
    pub provider: Option<String>,
    pub group: Option<String>,
    pub tlp: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Journal key of the source
    pub name: String,

    #[serde(default)]
    pub format: FeedFormat,

    /// Line pattern for `format = "regex"`; one capture group per value
    pub pattern: Option<String>,

    /// Observable field for each record column, in order
    pub values: Vec<String>,

    #[serde(default)]
    pub start: u64,

    pub end: Option<u64>,

    #[serde(default)]
    pub defaults: FeedDefaults,
}

impl FeedConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: FeedConfig = toml::from_str(&text).map_err(|e| {
            CifError::Config(format!("Invalid feed file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Expected field count per record
    pub fn valuecount(&self) -> usize {
        self.values.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CifError::Config("Feed name cannot be empty".to_string()));
        }

        if !self.values.iter().any(|v| v == "observable") {
            return Err(CifError::Config(format!(
                "Feed {} must map a column to 'observable'",
                self.name
            )));
        }

        if let Some(unknown) = self.values.iter().find(|v| !KNOWN_FIELDS.contains(&v.as_str())) {
            return Err(CifError::Config(format!(
                "Feed {} maps unknown field '{}'",
                self.name, unknown
            )));
        }

        if self.defaults.otype.is_none() && !self.values.iter().any(|v| v == "otype") {
            return Err(CifError::Config(format!(
                "Feed {} needs defaults.otype or an 'otype' column",
                self.name
            )));
        }

        if self.defaults.confidence.is_some_and(|c| c > 100) {
            return Err(CifError::Config("Default confidence must be 0-100".to_string()));
        }

        if self.end.is_some_and(|end| end == 0) {
            return Err(CifError::Config("Feed end bound must be greater than 0".to_string()));
        }

        if self.format == FeedFormat::Regex {
            let pattern = self.compiled_pattern()?;
            let groups = pattern.captures_len().saturating_sub(1);
            if groups != self.valuecount() {
                return Err(CifError::Config(format!(
                    "Feed {} pattern has {} capture groups but {} values",
                    self.name,
                    groups,
                    self.valuecount()
                )));
            }
        }

        Ok(())
    }

    fn compiled_pattern(&self) -> Result<Regex> {
        let pattern = self.pattern.as_deref().ok_or_else(|| {
            CifError::Config(format!("Feed {} uses format=regex without a pattern", self.name))
        })?;
        Regex::new(pattern).map_err(|e| CifError::Config(format!("Invalid pattern: {}", e)))
    }

    /// Wrap `reader` in the record source this feed's format calls for
    pub fn open<R: BufRead + 'static>(&self, reader: R) -> Result<Box<dyn RecordSource>> {
        Ok(match self.format {
            FeedFormat::Csv => Box::new(DelimitedSource::new(reader, b',')),
            FeedFormat::Tsv => Box::new(DelimitedSource::new(reader, b'\t')),
            FeedFormat::Regex => Box::new(RegexSource::new(reader, self.compiled_pattern()?)),
        })
    }

    /// Build an observable from a record whose field count already matched.
    ///
    /// Fails when the observable column is blank or a typed column does not
    /// parse; the parser counts such records as structural mismatches.
    pub fn build_observable(&self, record: &[String]) -> Result<Observable> {
        let column = |name: &str| {
            self.values
                .iter()
                .position(|v| v == name)
                .and_then(|i| record.get(i))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        };

        let value = column("observable")
            .ok_or_else(|| CifError::Parse("Record has an empty observable".to_string()))?;

        let otype = match column("otype") {
            Some(raw) => raw.parse()?,
            None => self
                .defaults
                .otype
                .ok_or_else(|| CifError::Parse("Record has no observable type".to_string()))?,
        };

        let mut observable = Observable::new(otype, value);
        observable.tags = self.defaults.tags.clone();
        observable.confidence = self.defaults.confidence;
        observable.provider = self.defaults.provider.clone();
        observable.group = self.defaults.group.clone();
        observable.tlp = self.defaults.tlp.clone();
        observable.description = self.defaults.description.clone();

        for (name, raw) in self.values.iter().zip(record) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match name.as_str() {
                "confidence" => {
                    let confidence: u8 = raw
                        .parse()
                        .ok()
                        .filter(|c| *c <= 100)
                        .ok_or_else(|| CifError::Parse(format!("Invalid confidence: {}", raw)))?;
                    observable.confidence = Some(confidence);
                },
                "tags" => {
                    observable.tags = raw
                        .split([',', ' ', '|'])
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                },
                "tlp" => observable.tlp = Some(raw.to_string()),
                "provider" => observable.provider = Some(raw.to_string()),
                "group" => observable.group = Some(raw.to_string()),
                "description" => observable.description = Some(raw.to_string()),
                "application" => observable.application = Some(raw.to_string()),
                "protocol" => observable.protocol = Some(raw.to_string()),
                "portlist" => observable.portlist = Some(raw.to_string()),
                "cc" => observable.cc = Some(raw.to_uppercase()),
                "asn" => {
                    let asn = raw.trim_start_matches("AS").trim_start_matches("as");
                    observable.asn = Some(
                        asn.parse()
                            .map_err(|_| CifError::Parse(format!("Invalid asn: {}", raw)))?,
                    );
                },
                "firsttime" => observable.firsttime = Some(parse_timestamp(raw)?),
                "lasttime" => observable.lasttime = Some(parse_timestamp(raw)?),
                "reporttime" => observable.reporttime = Some(parse_timestamp(raw)?),
                _ => {},
            }
        }

        Ok(observable)
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or unix epoch seconds
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| CifError::Parse(format!("Invalid timestamp: {}", raw)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn feed(values: &[&str]) -> FeedConfig {
        FeedConfig {
            name: "test-feed".to_string(),
            format: FeedFormat::Csv,
            pattern: None,
            values: values.iter().map(|v| v.to_string()).collect(),
            start: 0,
            end: None,
            defaults: FeedDefaults {
                otype: Some(ObservableType::Ipv4),
                tags: vec!["scanner".to_string()],
                confidence: Some(65),
                provider: Some("example.org".to_string()),
                ..Default::default()
            },
        }
    }

    fn record(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_build_observable_applies_defaults_then_columns() {
        let config = feed(&["observable", "confidence", "_", "lasttime"]);
        let observable = config
            .build_observable(&record(&["192.0.2.1", "90", "ignored", "2024-03-01T10:00:00Z"]))
            .unwrap();

        assert_eq!(observable.identity(), (ObservableType::Ipv4, "192.0.2.1"));
        assert_eq!(observable.confidence, Some(90));
        assert_eq!(observable.tags, vec!["scanner".to_string()]);
        assert_eq!(observable.provider.as_deref(), Some("example.org"));
        assert_eq!(observable.lasttime.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_build_observable_type_column_overrides_default() {
        let config = feed(&["otype", "observable"]);
        let observable = config.build_observable(&record(&["fqdn", "example.com"])).unwrap();
        assert_eq!(observable.otype(), ObservableType::Fqdn);
    }

    #[test]
    fn test_build_observable_rejects_bad_values() {
        let config = feed(&["observable", "confidence"]);
        assert!(config.build_observable(&record(&["", "10"])).is_err());
        assert!(config.build_observable(&record(&["192.0.2.1", "high"])).is_err());
        assert!(config.build_observable(&record(&["192.0.2.1", "101"])).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("0").unwrap().timestamp(), 0);
        assert_eq!(
            parse_timestamp("2024-01-02 03:04:05").unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(feed(&["observable"]).validate().is_ok());
        assert!(feed(&["description"]).validate().is_err());
        assert!(feed(&["observable", "colour"]).validate().is_err());

        let mut no_type = feed(&["observable"]);
        no_type.defaults.otype = None;
        assert!(no_type.validate().is_err());

        let mut regex = feed(&["observable", "description"]);
        regex.format = FeedFormat::Regex;
        assert!(regex.validate().is_err());
        regex.pattern = Some(r"^(\S+)\s+(.*)$".to_string());
        assert!(regex.validate().is_ok());
        regex.pattern = Some(r"^(\S+)$".to_string());
        assert!(regex.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            name = "urlhaus"
            format = "tsv"
            values = ["observable", "tags"]
            start = 9
            end = 1000

            [defaults]
            otype = "url"
            confidence = 75
        "#;
        let config: FeedConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.format, FeedFormat::Tsv);
        assert_eq!(config.start, 9);
        assert_eq!(config.end, Some(1000));
        assert_eq!(config.valuecount(), 2);
        assert_eq!(config.defaults.otype, Some(ObservableType::Url));
    }
}
