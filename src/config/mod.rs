//! Configuration
//!
//! Typed settings, JSON loading and validation, and the error taxonomy.

pub mod loader;
pub mod types;
