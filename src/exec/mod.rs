//! Process execution
//!
//! Interpreter child spawning, resource limits, and reaping.

pub mod limits;
pub mod process;
pub mod reaper;
