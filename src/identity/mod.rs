//! Requester identity
//!
//! Case-insensitive names, session key canonicalization, and per-requester
//! working state.

pub mod key;
pub mod name;
pub mod working;
