//! Outbound flood protection

pub mod bucket;
pub mod outbound;
