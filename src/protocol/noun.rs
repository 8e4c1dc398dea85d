//! Binary noun payloads carried by callback frames.
//!
//! A noun is a sequence of machine words: flag, type, element count, rank,
//! `rank` shape words, then the body. The first byte of the flag word names
//! the word layout. Only literal (byte string) nouns are decoded.

const NOUN_LITERAL: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WordLayout {
    Be32,
    Le32,
    /// 64-bit big-endian; only the low half is read
    Be64,
    /// 64-bit little-endian; only the low half is read
    Le64,
}

impl WordLayout {
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0xe0 => Some(WordLayout::Be32),
            0xe1 => Some(WordLayout::Le32),
            0xe2 => Some(WordLayout::Be64),
            0xe3 => Some(WordLayout::Le64),
            _ => None,
        }
    }

    pub fn marker(self) -> u8 {
        match self {
            WordLayout::Be32 => 0xe0,
            WordLayout::Le32 => 0xe1,
            WordLayout::Be64 => 0xe2,
            WordLayout::Le64 => 0xe3,
        }
    }

    pub fn width(self) -> usize {
        match self {
            WordLayout::Be32 | WordLayout::Le32 => 4,
            WordLayout::Be64 | WordLayout::Le64 => 8,
        }
    }

    fn read(self, word: &[u8]) -> u64 {
        let half = |b: &[u8]| [b[0], b[1], b[2], b[3]];
        match self {
            WordLayout::Be32 => u32::from_be_bytes(half(word)) as u64,
            WordLayout::Le32 => u32::from_le_bytes(half(word)) as u64,
            WordLayout::Be64 => u32::from_be_bytes(half(&word[4..])) as u64,
            WordLayout::Le64 => u32::from_le_bytes(half(word)) as u64,
        }
    }
}

struct Words<'a> {
    layout: WordLayout,
    rest: &'a [u8],
}

impl<'a> Words<'a> {
    fn next(&mut self) -> Option<u64> {
        let width = self.layout.width();
        if self.rest.len() < width {
            return None;
        }
        let (word, rest) = self.rest.split_at(width);
        self.rest = rest;
        Some(self.layout.read(word))
    }

    fn skip(&mut self, words: u64) -> Option<()> {
        let bytes = usize::try_from(words).ok()?.checked_mul(self.layout.width())?;
        self.rest = self.rest.get(bytes..)?;
        Some(())
    }

    fn take(&mut self, bytes: u64) -> Option<&'a [u8]> {
        let bytes = usize::try_from(bytes).ok()?;
        let taken = self.rest.get(..bytes)?;
        self.rest = &self.rest[bytes..];
        Some(taken)
    }
}

/// Decode a literal noun into its bytes. Any other noun type, an unknown
/// layout marker, or a truncated payload yields `None`.
pub fn decode_literal(payload: &[u8]) -> Option<Vec<u8>> {
    let layout = WordLayout::from_marker(*payload.first()?)?;
    let mut words = Words {
        layout,
        rest: payload,
    };
    let _flag = words.next()?;
    let noun_type = words.next()?;
    let count = words.next()?;
    let rank = words.next()?;
    words.skip(rank)?;
    if noun_type != NOUN_LITERAL {
        return None;
    }
    words.take(count).map(<[u8]>::to_vec)
}

/// Encode `text` as a rank-1 literal noun in the given layout.
pub fn encode_literal(layout: WordLayout, text: &[u8]) -> Vec<u8> {
    encode_noun(layout, NOUN_LITERAL, &[text.len() as u64], text)
}

/// Encode an arbitrary noun header followed by `body`. The element count is
/// the product of `shape`.
pub fn encode_noun(layout: WordLayout, noun_type: u64, shape: &[u64], body: &[u8]) -> Vec<u8> {
    let count: u64 = shape.iter().product();
    let mut out = Vec::with_capacity(layout.width() * (4 + shape.len()) + body.len());
    let mut push = |value: u64| {
        let value = value as u32;
        match layout {
            WordLayout::Be32 => out.extend_from_slice(&value.to_be_bytes()),
            WordLayout::Le32 => out.extend_from_slice(&value.to_le_bytes()),
            WordLayout::Be64 => {
                out.extend_from_slice(&[0; 4]);
                out.extend_from_slice(&value.to_be_bytes());
            }
            WordLayout::Le64 => {
                out.extend_from_slice(&value.to_le_bytes());
                out.extend_from_slice(&[0; 4]);
            }
        }
    };

    push(0);
    push(noun_type);
    push(count);
    push(shape.len() as u64);
    for dim in shape {
        push(*dim);
    }
    // The flag word's leading byte doubles as the layout marker.
    out[0] = layout.marker();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_literal_in_every_layout() {
        for layout in [WordLayout::Be32, WordLayout::Le32, WordLayout::Be64, WordLayout::Le64] {
            let payload = encode_literal(layout, b"hello wd");
            assert_eq!(payload[0], layout.marker());
            assert_eq!(decode_literal(&payload).as_deref(), Some(&b"hello wd"[..]), "{:?}", layout);
        }
    }

    #[test]
    fn test_hand_built_big_endian_noun() {
        // flag, type 2, count 3, rank 1, shape 3, body "abc"
        let mut payload = vec![0xe0, 0, 0, 0];
        for word in [2u32, 3, 1, 3] {
            payload.extend_from_slice(&word.to_be_bytes());
        }
        payload.extend_from_slice(b"abc");
        assert_eq!(decode_literal(&payload), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_non_literal_types_are_not_decoded() {
        let payload = encode_noun(WordLayout::Le64, 4, &[2], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_literal(&payload), None);
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert_eq!(decode_literal(&[]), None);
        assert_eq!(decode_literal(b"plain text"), None);

        let mut truncated = encode_literal(WordLayout::Le32, b"abcdef");
        truncated.truncate(truncated.len() - 2);
        assert_eq!(decode_literal(&truncated), None);

        // rank claims far more shape words than present
        let mut huge_rank = vec![0xe1, 0, 0, 0];
        for word in [2u32, 1, u32::MAX] {
            huge_rank.extend_from_slice(&word.to_le_bytes());
        }
        assert_eq!(decode_literal(&huge_rank), None);
    }

    #[test]
    fn test_empty_literal() {
        assert_eq!(decode_literal(&encode_literal(WordLayout::Be64, b"")), Some(Vec::new()));
    }
}
