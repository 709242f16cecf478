//! Command line interface of the `cif-worker` binary

use clap::Parser;

use crate::config::WorkerConfig;

/// Consume observables, enrich them, persist and republish the results
///
/// Everything not given on the command line comes from `CIF_*` environment
/// variables (or `.env`).
#[derive(Parser, Debug, Default)]
#[command(name = "cif-worker")]
#[command(author, version, about = "CIF observable worker")]
pub struct Cli {
    /// Worker name used in thread names and consumer tags
    #[arg(short, long)]
    pub name: Option<String>,

    /// Number of consumer threads
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: Option<u16>,

    /// Storage backend (memory, jsonl)
    #[arg(short, long)]
    pub storage: Option<String>,

    /// URI passed to the storage backend's connect
    #[arg(long)]
    pub storage_uri: Option<String>,

    /// Broker URI; `memory://` runs against an in-process broker
    #[arg(long)]
    pub mq_uri: Option<String>,

    /// Meta-fetchers to run, in order
    #[arg(long, value_delimiter = ',')]
    pub meta: Option<Vec<String>>,

    /// Plugins to run, in order
    #[arg(long, value_delimiter = ',')]
    pub plugins: Option<Vec<String>>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Override `config` with whatever was given on the command line
    pub fn apply(self, mut config: WorkerConfig) -> WorkerConfig {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(threads) = self.threads {
            config.threads = usize::from(threads);
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
        if let Some(uri) = self.storage_uri {
            config.storage_uri = uri;
        }
        if let Some(uri) = self.mq_uri {
            config.mq_uri = uri;
        }
        if let Some(meta) = self.meta {
            config.meta = meta;
        }
        if let Some(plugins) = self.plugins {
            config.plugins = plugins;
        }
        config
    }
}
