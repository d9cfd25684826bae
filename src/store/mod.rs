//! Job status store: persisted batch job ids for reconnecting after a restart.

mod jobs;

pub use jobs::*;
