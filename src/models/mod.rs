//! Data models.

pub mod config;
pub mod device;
pub mod firmware;
pub mod payload;
pub mod session;
