//! Infrastructure adapters and runtime bootstrap.

pub mod content_index;
pub mod error;
pub mod telemetry;
pub mod warmer;
