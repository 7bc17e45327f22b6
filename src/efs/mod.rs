//! Client for the controller's embedded file system.
//!
//! Files are identified by a one byte name and sized in pages. Permission
//! and bounds checks run on the host before any data is transferred; the
//! controller repeats them.
pub mod client;
pub mod types;

pub use client::page_chunks;
pub use types::*;
