//! LG TV Downgrade Library
//!
//! Discovers LG webOS TVs, looks up older firmware, stages it on a USB drive
//! and drives the device through a guarded downgrade session.

pub mod cli;
pub mod core;
pub mod error;
pub mod models;
pub mod preflight;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
