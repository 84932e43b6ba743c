//! # reel-core
//!
//! Core types, traits, and abstractions for the reel generation queue.
//!
//! This crate provides the data model (jobs, stages, provider health and
//! breaker status), the error taxonomy, shared defaults, and the traits the
//! queue uses to reach persistence and credential checks.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
