//! Manifest parsing and environment resolution

mod environment;
mod manifest;

pub use environment::*;
pub use manifest::*;
