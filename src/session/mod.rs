//! Interpreter sessions
//!
//! One session drives one interpreter process through handshake, command
//! exchange, state restore/save and teardown.

pub mod abort;
pub mod callback;
pub mod interpreter;
