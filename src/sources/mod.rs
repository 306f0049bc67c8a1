//! Log source implementations
//!
//! The collection loop consumes anything implementing
//! [`crate::core::LogSource`]; this module provides the file-tailing
//! implementation used for classic `/var/log/mail.log` setups.

pub mod file;

pub use file::FileLogSource;
