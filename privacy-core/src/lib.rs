//! privacy-core: detection, single-subject tracking, a two-context box
//! handoff and the privacy overlay drawn from it.

pub mod config;
pub mod detection;
pub mod geometry;
pub mod handoff;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod tracking;
pub mod video;

// Hosts can name errors as `privacy_core::Error` without depending on anyhow.
pub use anyhow::Error;
pub use anyhow::Result;
