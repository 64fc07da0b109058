//! Service log collection: entries, noise filters, bounded buffers and the
//! per-run manager

mod buffer;
mod entry;
mod filter;
mod manager;

pub use buffer::*;
pub use entry::*;
pub use filter::*;
pub use manager::*;
