//! CIF Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the CIF workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used by the feeder and the worker:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Fingerprints**: Stable identity hashes used by parse journals
//! - **Types**: The [`Observable`](types::Observable) model that flows through every stage
//! - **Logging**: Centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use cif_common::types::{Observable, ObservableType};
//! use cif_common::fingerprint::fingerprint;
//!
//! let observable = Observable::new(ObservableType::Fqdn, "example.com");
//! println!("fingerprint: {}", fingerprint(&observable));
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CifError, Result};
pub use types::{Observable, ObservableType};
