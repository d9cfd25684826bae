//! Batch mode: manifest codec, job lifecycle and manager.

mod job;
mod manager;
mod manifest;

pub use job::*;
pub use manager::*;
pub use manifest::*;
