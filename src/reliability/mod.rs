//! Inter-rater reliability statistics.

mod agreement;

pub use agreement::*;
