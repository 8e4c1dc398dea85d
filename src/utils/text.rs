/// Text shaping for relayed interpreter output and log lines

/// Replace C0 control characters and DEL with spaces.
pub fn blank_control(text: &str) -> String {
    text.chars()
        .map(|c| if c < '\u{20}' || c == '\u{7f}' { ' ' } else { c })
        .collect()
}

/// Render control characters, C1 controls and `~` as `~xx` hex so a
/// logged value always stays on one line.
pub fn escape_control(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c < '\u{20}' || c == '~' || ('\u{7f}'..='\u{9f}').contains(&c) {
            out.push_str(&format!("~{:02x}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Keep at most `width` characters.
pub fn truncate_chars(text: &str, width: usize) -> &str {
    match text.char_indices().nth(width) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

/// One relayable display line: control characters blanked, then cut to `width`.
pub fn display_line(line: &str, width: usize) -> String {
    truncate_chars(&blank_control(line), width).to_string()
}

/// Output of one command, split into display lines as it arrives.
///
/// Holds at most `max_lines` lines and one partial line of at most
/// `4 * width` bytes, however much the interpreter writes. Lines past the
/// budget are only counted. Terminators are removed, `\r\n` included, and a
/// trailing terminator does not start an extra empty line.
#[derive(Debug)]
pub struct LineCapture {
    max_lines: usize,
    width: usize,
    lines: Vec<String>,
    partial: Vec<u8>,
    /// Bytes were seen since the last terminator
    open: bool,
    /// The partial line hit its byte bound
    clipped: bool,
    dropped: usize,
}

impl LineCapture {
    pub fn new(max_lines: usize, width: usize) -> Self {
        Self {
            max_lines,
            width,
            lines: Vec::new(),
            partial: Vec::new(),
            open: false,
            clipped: false,
            dropped: 0,
        }
    }

    fn max_line_bytes(&self) -> usize {
        // `width` chars of UTF-8, or of lossy replacements, fit in this
        self.width.saturating_mul(4)
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for chunk in bytes.split_inclusive(|&b| b == b'\n') {
            let (body, terminated) = match chunk.strip_suffix(b"\n") {
                Some(body) => (body, true),
                None => (chunk, false),
            };
            if !body.is_empty() {
                self.open = true;
                if self.lines.len() < self.max_lines {
                    let room = self.max_line_bytes().saturating_sub(self.partial.len());
                    if body.len() > room {
                        self.clipped = true;
                    }
                    self.partial.extend_from_slice(&body[..body.len().min(room)]);
                }
            }
            if terminated {
                self.end_line();
            }
        }
    }

    fn end_line(&mut self) {
        if self.lines.len() < self.max_lines {
            let mut raw = std::mem::take(&mut self.partial);
            if !self.clipped && raw.last() == Some(&b'\r') {
                raw.pop();
            }
            self.lines.push(display_line(&String::from_utf8_lossy(&raw), self.width));
        } else {
            self.dropped += 1;
        }
        self.partial.clear();
        self.open = false;
        self.clipped = false;
    }

    /// Bytes currently held.
    pub fn buffered_bytes(&self) -> usize {
        self.lines.iter().map(String::len).sum::<usize>() + self.partial.len()
    }

    /// Close any unterminated line and hand back the kept lines with the
    /// number dropped, leaving the capture empty.
    pub fn finish(&mut self) -> (Vec<String>, usize) {
        if self.open {
            self.end_line();
        }
        (std::mem::take(&mut self.lines), std::mem::take(&mut self.dropped))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
        self.open = false;
        self.clipped = false;
        self.dropped = 0;
    }
}
