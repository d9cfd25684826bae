//! Pool module - bounded-concurrency live classification.

mod live;

pub use live::*;
