//! Utilities
//!
//! Text shaping shared by the session and the front end.

pub mod text;
