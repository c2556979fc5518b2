//! Filesystem full-page snapshot cache.
//!
//! The [`cache`] module is the engine: a host server wraps its router with
//! [`cache::install_layers`] and reports content changes through
//! [`cache::CacheTrigger`]. The remaining modules back the `snapcache`
//! operator binary.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
