//! Functionality that is convenient for more than one `jobrelay` crate, but
//! which isn't data-model-level enough to live in [`jobrelay_base`]. In the
//! spirit of `maelstrom_util`: a grab bag, kept small.

pub mod backoff;
pub mod config;
pub mod ext;
pub mod fs;
pub mod log;
pub mod random;
