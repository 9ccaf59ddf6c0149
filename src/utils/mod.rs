//! Shared utilities.

pub mod fs;
pub mod hash;
pub mod netrange;
pub mod version;
