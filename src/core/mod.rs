//! Core orchestration modules.

pub mod backoff;
pub mod catalog;
pub mod discovery;
pub mod fetcher;
pub mod locks;
pub mod media;
pub mod session;
pub mod stager;
