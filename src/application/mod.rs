//! Operator-facing use cases composed from the engine and infrastructure.

pub mod commands;
pub mod error;
