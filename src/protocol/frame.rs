//! Frame wire format shared with the interpreter bridge.
//!
//! ```text
//! 0        1        4        8        12
//! +--------+--------+--------+--------+----------------+
//! | code   | 0 0 0  | tag BE | len BE | payload (len)  |
//! +--------+--------+--------+--------+----------------+
//! ```

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::config::types::EvalError;

pub const HEADER_LEN: usize = 12;

/// Every frame kind either side may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Evaluate a new statement
    Do = 1,
    /// Statement finished; tag is the result code
    DoAck = 2,
    /// Interpreter wants more input; payload is the prompt
    Input = 3,
    /// Reply to `Input`
    InputAck = 4,
    /// Foreign callback request; tag is the callback type
    Callback = 5,
    CallbackAck = 6,
    /// Captured output text; tag is the output kind
    Output = 7,
    Break = 8,
    /// Fetch a variable's serialized value
    Get = 9,
    GetAck = 10,
    /// Name the variable the next `Set` assigns
    SetName = 11,
    Set = 12,
    SetAck = 13,
    Edit = 14,
    File = 15,
    /// Interpreter is exiting
    Exit = 16,
}

impl CommandCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandCode::Do => "DO",
            CommandCode::DoAck => "DOZ",
            CommandCode::Input => "IN",
            CommandCode::InputAck => "INZ",
            CommandCode::Callback => "WD",
            CommandCode::CallbackAck => "WDZ",
            CommandCode::Output => "OUT",
            CommandCode::Break => "BRK",
            CommandCode::Get => "GET",
            CommandCode::GetAck => "GETZ",
            CommandCode::SetName => "SETN",
            CommandCode::Set => "SET",
            CommandCode::SetAck => "SETZ",
            CommandCode::Edit => "ED",
            CommandCode::File => "FL",
            CommandCode::Exit => "EXIT",
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => CommandCode::Do,
            2 => CommandCode::DoAck,
            3 => CommandCode::Input,
            4 => CommandCode::InputAck,
            5 => CommandCode::Callback,
            6 => CommandCode::CallbackAck,
            7 => CommandCode::Output,
            8 => CommandCode::Break,
            9 => CommandCode::Get,
            10 => CommandCode::GetAck,
            11 => CommandCode::SetName,
            12 => CommandCode::Set,
            13 => CommandCode::SetAck,
            14 => CommandCode::Edit,
            15 => CommandCode::File,
            16 => CommandCode::Exit,
            other => return Err(FrameError::UnknownCode(other)),
        })
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire codec failures
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Truncated frame")]
    Truncated,

    #[error("Unknown command code {0}")]
    UnknownCode(u8),

    #[error("Reserved header bytes are not zero")]
    ReservedBits,

    #[error("Payload of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: u64, limit: u64 },
}

impl From<FrameError> for EvalError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => EvalError::Io(e),
            FrameError::Closed => EvalError::ChildExited,
            other => EvalError::ProtocolViolation(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub code: CommandCode,
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: CommandCode, tag: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            tag,
            payload: payload.into(),
        }
    }

    /// A frame with an empty payload.
    pub fn bare(code: CommandCode, tag: u32) -> Self {
        Self::new(code, tag, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = u32::try_from(self.payload.len()).map_err(|_| FrameError::TooLarge {
            len: self.payload.len() as u64,
            limit: u32::MAX as u64,
        })?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.code.code());
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&self.tag.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a header into (code, tag, payload length).
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(CommandCode, u32, u32), FrameError> {
        if header[1..4] != [0, 0, 0] {
            return Err(FrameError::ReservedBits);
        }
        let code = CommandCode::try_from(header[0])?;
        let tag = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        Ok((code, tag, len))
    }
}

/// Read until `buf` is full or EOF; returns bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one frame. EOF on a frame boundary is [`FrameError::Closed`]; EOF
/// anywhere else is [`FrameError::Truncated`].
pub fn read_frame<R: Read>(reader: &mut R, max_payload: u32) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match fill(reader, &mut header)? {
        0 => return Err(FrameError::Closed),
        HEADER_LEN => {}
        _ => return Err(FrameError::Truncated),
    }
    let (code, tag, len) = Frame::decode_header(&header)?;
    if len > max_payload {
        return Err(FrameError::TooLarge {
            len: len as u64,
            limit: max_payload as u64,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if fill(reader, &mut payload)? != payload.len() {
        return Err(FrameError::Truncated);
    }
    Ok(Frame { code, tag, payload })
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()?)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout_is_bit_exact() {
        let bytes = Frame::new(CommandCode::Output, 0x0102_0304, "hi").encode().unwrap();
        assert_eq!(
            bytes,
            vec![7, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 2, b'h', b'i']
        );
    }

    #[test]
    fn test_reads_consecutive_frames() {
        let mut wire = Vec::new();
        wire.extend(Frame::new(CommandCode::Output, 1, "line\n").encode().unwrap());
        wire.extend(Frame::bare(CommandCode::DoAck, 0).encode().unwrap());
        let mut cursor = Cursor::new(wire);

        let first = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(first.code, CommandCode::Output);
        assert_eq!(first.payload, b"line\n");
        let second = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(second, Frame::bare(CommandCode::DoAck, 0));
        assert!(matches!(read_frame(&mut cursor, 1024), Err(FrameError::Closed)));
    }

    #[test]
    fn test_rejects_reserved_bytes() {
        let mut bytes = Frame::bare(CommandCode::Do, 0).encode().unwrap();
        bytes[2] = 1;
        let err = read_frame(&mut Cursor::new(bytes), 16).unwrap_err();
        assert!(matches!(err, FrameError::ReservedBits));
    }

    #[test]
    fn test_rejects_unknown_codes() {
        for code in [0u8, 17, 255] {
            let mut header = [0u8; HEADER_LEN];
            header[0] = code;
            assert!(matches!(
                Frame::decode_header(&header),
                Err(FrameError::UnknownCode(c)) if c == code
            ));
        }
        for code in 1u8..=16 {
            assert_eq!(CommandCode::try_from(code).unwrap().code(), code);
        }
    }

    #[test]
    fn test_oversized_payload_refused_before_allocation() {
        let mut header = Frame::bare(CommandCode::Output, 0).encode().unwrap();
        header[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = read_frame(&mut Cursor::new(header), 1 << 20).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { limit, .. } if limit == 1 << 20));
    }

    #[test]
    fn test_truncation_detected() {
        let bytes = Frame::new(CommandCode::Output, 0, "abcdef").encode().unwrap();
        let short_body = bytes[..bytes.len() - 2].to_vec();
        assert!(matches!(
            read_frame(&mut Cursor::new(short_body), 64),
            Err(FrameError::Truncated)
        ));
        let short_header = bytes[..5].to_vec();
        assert!(matches!(
            read_frame(&mut Cursor::new(short_header), 64),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn test_frame_errors_map_to_taxonomy() {
        assert!(matches!(EvalError::from(FrameError::Closed), EvalError::ChildExited));
        assert!(matches!(
            EvalError::from(FrameError::UnknownCode(99)),
            EvalError::ProtocolViolation(_)
        ));
    }
}
