//! Traffic guard
//!
//! Adaptive traffic protection for an HTTP backend: per-request admission
//! control and response caching, with an out-of-band threat monitor,
//! automated mitigation and a daily audit.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
