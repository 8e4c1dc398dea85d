//! Interpreter bridge protocol

pub mod frame;
pub mod noun;

pub use frame::{read_frame, write_frame, CommandCode, Frame, FrameError};
