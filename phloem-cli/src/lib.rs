//! Phloem CLI library
//!
//! Exposes profile loading and results output so integration tests can
//! drive them directly.

pub mod output;
pub mod profile;
