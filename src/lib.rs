//! Connlimit - Per-Connection Traffic Shaping
//!
//! This crate meters every connection of a network server against a
//! per-second budget, either in messages or in bytes. A connection that
//! overruns its budget has its reads paused until the next one-second
//! window, or has its excess dropped when the transport cannot be paused.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
