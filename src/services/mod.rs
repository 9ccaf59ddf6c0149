//! External service integrations.

pub mod catalog;
pub mod luna;
pub mod probe;
pub mod remote;
pub mod ssh;
