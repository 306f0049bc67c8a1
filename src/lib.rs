//! Postwatch - Postfix metrics exporter
//!
//! This library provides the core functionality for turning a Postfix
//! instance's log stream and mail-queue listings into Prometheus metrics:
//! a log line classification engine, the mapping from classified lines to
//! labeled counter and histogram updates, and a parser for both encodings
//! of the `showq` queue listing.

pub mod classify;
pub mod cli;
pub mod collector;
pub mod config;
pub mod core;
pub mod registry;
pub mod server;
pub mod showq;
pub mod sources;

// Re-export core types for convenience
pub use crate::core::*;
