//! Append-only JSON-lines file backend

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

use cif_common::fingerprint::fingerprint;
use cif_common::{CifError, Observable, Result};

use super::{Backend, CreateAtomicity};

/// Writes one JSON document per observable.
///
/// The URI is a file path, optionally prefixed with `file://`. Identities
/// already in the file are loaded on `connect` and skipped on `create`.
#[derive(Debug, Default)]
pub struct JsonlBackend {
    path: Option<PathBuf>,
    file: Option<File>,
    seen: HashSet<String>,
}

impl JsonlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn load_existing(&mut self, path: &PathBuf) -> Result<()> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match Observable::from_json(line.as_bytes()) {
                Ok(observable) => {
                    self.seen.insert(fingerprint(&observable));
                },
                Err(e) => warn!(path = %path.display(), line = number + 1, error = %e, "Skipping unreadable line"),
            }
        }
        Ok(())
    }
}

impl Backend for JsonlBackend {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn atomicity(&self) -> CreateAtomicity {
        CreateAtomicity::PerItem
    }

    fn connect(&mut self, uri: &str) -> Result<()> {
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        if path.as_os_str().is_empty() {
            return Err(CifError::Backend("jsonl backend needs a file path".to_string()));
        }

        self.load_existing(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), known = self.seen.len(), "Opened jsonl store");

        self.file = Some(file);
        self.path = Some(path);
        Ok(())
    }

    fn create(&mut self, observables: &[Observable]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CifError::Backend("jsonl backend is not connected".to_string()))?;

        for observable in observables {
            let key = fingerprint(observable);
            if self.seen.contains(&key) {
                continue;
            }
            // One write per line; nothing is left buffered if it fails
            let mut line = serde_json::to_vec(observable)?;
            line.push(b'\n');
            file.write_all(&line)?;
            self.seen.insert(key);
        }
        Ok(())
    }
}
