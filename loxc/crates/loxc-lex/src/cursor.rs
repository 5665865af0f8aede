//! Byte-oriented scanning cursor over the source buffer.
//!
//! Lox source is "UTF-8 tolerant" per spec.md §3.3: the lexer only ever
//! branches on ASCII punctuation/keyword bytes and otherwise treats the
//! buffer as opaque bytes, so scanning is byte-indexed rather than
//! char-indexed (matches clox's `char*` cursor, and avoids the unicode
//! segmentation `faxc-lex`'s `unicode.rs` needs for its richer identifier
//! grammar, which this language doesn't have).

pub struct Cursor<'a> {
    source: &'a [u8],
    token_start: usize,
    current: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self {
            source,
            token_start: 0,
            current: 0,
        }
    }

    pub fn start_token(&mut self) {
        self.token_start = self.current;
    }

    pub fn advance(&mut self) -> Option<u8> {
        let b = *self.source.get(self.current)?;
        self.current += 1;
        Some(b)
    }

    pub fn peek(&self) -> Option<u8> {
        self.source.get(self.current).copied()
    }

    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.current + offset).copied()
    }

    pub fn match_byte(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    /// The bytes of the token currently being scanned, decoded lossily as
    /// UTF-8 so the rest of the compiler can work with `&str` (source is
    /// only "tolerant" of arbitrary bytes inside string literals and
    /// comments; identifiers/keywords/numbers are always plain ASCII).
    pub fn lexeme(&self) -> &'a str {
        std::str::from_utf8(&self.source[self.token_start..self.current]).unwrap_or("")
    }
}
