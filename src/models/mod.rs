//! Core data models for codebook.
//!
//! - `classification`: label sets, requests and results
//! - `config`: TOML configuration
//! - `error`: structural and per-item error taxonomy

mod classification;
mod config;
mod error;

pub use classification::*;
pub use config::*;
pub use error::*;
