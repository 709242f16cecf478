//! Common types used across CIF

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CifError, Result};

/// Type tag of an observable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservableType {
    Ipv4,
    Ipv6,
    Fqdn,
    Url,
    Email,
    Md5,
    Sha1,
    Sha256,
    Asn,
}

impl ObservableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservableType::Ipv4 => "ipv4",
            ObservableType::Ipv6 => "ipv6",
            ObservableType::Fqdn => "fqdn",
            ObservableType::Url => "url",
            ObservableType::Email => "email",
            ObservableType::Md5 => "md5",
            ObservableType::Sha1 => "sha1",
            ObservableType::Sha256 => "sha256",
            ObservableType::Asn => "asn",
        }
    }
}

impl std::fmt::Display for ObservableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObservableType {
    type Err = CifError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ipv4" => Ok(ObservableType::Ipv4),
            "ipv6" => Ok(ObservableType::Ipv6),
            "fqdn" => Ok(ObservableType::Fqdn),
            "url" => Ok(ObservableType::Url),
            "email" => Ok(ObservableType::Email),
            "md5" => Ok(ObservableType::Md5),
            "sha1" => Ok(ObservableType::Sha1),
            "sha256" => Ok(ObservableType::Sha256),
            "asn" => Ok(ObservableType::Asn),
            other => Err(CifError::Parse(format!("Unknown observable type: {}", other))),
        }
    }
}

/// A single typed threat-intelligence fact.
///
/// The identity of an observable is its `(otype, observable)` pair. Both are
/// private and fixed at construction; every other field may be filled in by
/// the parser defaults or by meta-fetchers later on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    observable: String,
    otype: ObservableType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portlist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firsttime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lasttime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporttime: Option<DateTime<Utc>>,

    /// Enrichment results attached by meta-fetchers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Observable {
    pub fn new(otype: ObservableType, observable: impl Into<String>) -> Self {
        Self {
            observable: observable.into(),
            otype,
            confidence: None,
            tags: Vec::new(),
            tlp: None,
            provider: None,
            group: None,
            description: None,
            application: None,
            protocol: None,
            portlist: None,
            asn: None,
            cc: None,
            firsttime: None,
            lasttime: None,
            reporttime: None,
            meta: BTreeMap::new(),
        }
    }

    /// Observable value (IP, domain, URL, hash, ...)
    pub fn value(&self) -> &str {
        &self.observable
    }

    pub fn otype(&self) -> ObservableType {
        self.otype
    }

    /// Identity pair used for deduplication by journals and backends
    pub fn identity(&self) -> (ObservableType, &str) {
        (self.otype, &self.observable)
    }

    /// Derive a new observable that inherits provenance from `self`.
    ///
    /// Used by plugins: the derived observable keeps tags, tlp, provider,
    /// group, confidence and timestamps but starts with empty meta.
    pub fn derive(&self, otype: ObservableType, observable: impl Into<String>) -> Self {
        let mut derived = Observable::new(otype, observable);
        derived.confidence = self.confidence;
        derived.tags = self.tags.clone();
        derived.tlp = self.tlp.clone();
        derived.provider = self.provider.clone();
        derived.group = self.group.clone();
        derived.firsttime = self.firsttime;
        derived.lasttime = self.lasttime;
        derived.reporttime = self.reporttime;
        derived
    }

    /// Decode a work message body.
    ///
    /// Rejects invalid UTF-8, malformed JSON, unknown types and empty values.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| CifError::Parse(format!("Message body is not UTF-8: {}", e)))?;
        let observable: Observable = serde_json::from_str(text)?;
        if observable.observable.trim().is_empty() {
            return Err(CifError::Parse("Observable value is empty".to_string()));
        }
        Ok(observable)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
