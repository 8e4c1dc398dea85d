//! In-memory session state storage

pub mod heap;
pub mod lru;
