//! Wildcard byte patterns and the prefix-accelerated scanner.
//!
//! Pattern text is a sequence of 3-character tokens: two hex digits (exact byte) or `XX`
//! (wildcard byte), each followed by a single space, the last one included.
//!
//! ```text
//! "48 8D 0D XX XX XX XX E8 XX XX XX XX "
//! ```
//!
//! The first byte must be exact. The scanner relies on that: the leading run of exact bytes
//! is compared as a single 4, 2 or 1 byte integer before the full masked comparison runs.

use std::fmt;

use memchr::memchr_iter;
use thiserror::Error;

/// Literal marker of a wildcard token.
pub const WILDCARD: &str = "XX";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern length {0} is not a multiple of 3")]
    InvalidLength(usize),

    #[error("zero-length patterns are not allowed")]
    Empty,

    #[error("bytes must be separated by a single space (column {0})")]
    MissingSeparator(usize),

    #[error("invalid byte token '{token}' at column {column}")]
    InvalidToken { token: String, column: usize },

    #[error("first byte of a pattern must be an exact match")]
    WildcardFirst,
}

/// One element of a pattern. A wildcard has `mask == 0` and `value == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternByte {
    pub value: u8,
    pub mask: u8,
}

impl PatternByte {
    pub const fn exact(value: u8) -> Self {
        Self { value, mask: 0xFF }
    }

    pub const fn wildcard() -> Self {
        Self { value: 0, mask: 0 }
    }

    pub fn is_exact(&self) -> bool {
        self.mask == 0xFF
    }

    #[inline]
    pub fn matches(&self, byte: u8) -> bool {
        byte & self.mask == self.value
    }
}

/// Verdict returned by a scan callback for one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Stop scanning, the match was consumed.
    Stop,
    /// Keep scanning for further matches.
    Continue,
    /// The callback did not care about this match; keep scanning.
    NoOpinion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
    prefix_len: usize,
}

impl Pattern {
    /// Compile a textual pattern such as `"48 8B 05 XX XX XX XX "`.
    pub fn compile(text: &str) -> Result<Self, PatternError> {
        if text.is_empty() {
            return Err(PatternError::Empty);
        }

        let raw = text.as_bytes();
        if raw.len() % 3 != 0 {
            return Err(PatternError::InvalidLength(raw.len()));
        }

        let mut bytes = Vec::with_capacity(raw.len() / 3);
        for (index, chunk) in raw.chunks_exact(3).enumerate() {
            let start = index * 3;
            let token = &chunk[..2];
            if chunk[2] != b' ' {
                return Err(PatternError::MissingSeparator(start + 2));
            }

            if token == WILDCARD.as_bytes() {
                if index == 0 {
                    return Err(PatternError::WildcardFirst);
                }
                bytes.push(PatternByte::wildcard());
                continue;
            }

            let value = hex_byte(token[0], token[1]).ok_or_else(|| PatternError::InvalidToken {
                token: String::from_utf8_lossy(token).into_owned(),
                column: start,
            })?;
            bytes.push(PatternByte::exact(value));
        }

        Self::from_elements(bytes)
    }

    /// Build an exact pattern from a literal byte string. The NUL terminator is part of the
    /// pattern so that only whole C strings match.
    pub fn from_raw(literal: &[u8]) -> Self {
        let bytes: Vec<PatternByte> = literal
            .iter()
            .copied()
            .chain(std::iter::once(0))
            .map(PatternByte::exact)
            .collect();
        let prefix_len = bytes.len();
        Self { bytes, prefix_len }
    }

    /// Build a pattern from `Some(byte)` / `None` (wildcard) elements.
    pub fn from_options(elements: &[Option<u8>]) -> Result<Self, PatternError> {
        Self::from_elements(
            elements
                .iter()
                .map(|b| match b {
                    Some(value) => PatternByte::exact(*value),
                    None => PatternByte::wildcard(),
                })
                .collect(),
        )
    }

    fn from_elements(bytes: Vec<PatternByte>) -> Result<Self, PatternError> {
        match bytes.first() {
            None => return Err(PatternError::Empty),
            Some(first) if !first.is_exact() => return Err(PatternError::WildcardFirst),
            Some(_) => {}
        }

        let prefix_len = bytes.iter().take_while(|b| b.is_exact()).count();
        Ok(Self { bytes, prefix_len })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    /// Length of the leading run of exact bytes.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Width of the integer compare used as the reject filter.
    pub fn prefix_width(&self) -> usize {
        match self.prefix_len {
            n if n >= 4 => 4,
            n if n >= 2 => 2,
            _ => 1,
        }
    }

    /// Check the full pattern against `haystack` at `offset`.
    #[inline]
    pub fn matches_at(&self, haystack: &[u8], offset: usize) -> bool {
        match haystack.get(offset..offset + self.bytes.len()) {
            Some(window) => self
                .bytes
                .iter()
                .zip(window)
                .all(|(pattern, byte)| pattern.matches(*byte)),
            None => false,
        }
    }

    /// Scan `haystack` and invoke `callback` with the offset of every match.
    ///
    /// With `multiple == false` the scan ends after the first callback invocation whatever it
    /// returns. Otherwise only [`ScanControl::Stop`] ends it early.
    pub fn scan<F>(&self, haystack: &[u8], multiple: bool, mut callback: F)
    where
        F: FnMut(usize) -> ScanControl,
    {
        if haystack.len() < self.bytes.len() {
            return;
        }
        let last = haystack.len() - self.bytes.len();

        match self.prefix_width() {
            4 => self.scan_prefix4(haystack, last, multiple, &mut callback),
            2 => self.scan_prefix2(haystack, last, multiple, &mut callback),
            _ => self.scan_prefix1(haystack, last, multiple, &mut callback),
        }
    }

    /// Offsets of every match in `haystack`.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        let mut matches = Vec::new();
        self.scan(haystack, true, |offset| {
            matches.push(offset);
            ScanControl::Continue
        });
        matches
    }

    /// Offset of the first match in `haystack`.
    pub fn find_first(&self, haystack: &[u8]) -> Option<usize> {
        let mut found = None;
        self.scan(haystack, false, |offset| {
            found = Some(offset);
            ScanControl::Stop
        });
        found
    }

    fn scan_prefix1<F>(&self, haystack: &[u8], last: usize, multiple: bool, callback: &mut F)
    where
        F: FnMut(usize) -> ScanControl,
    {
        let initial = self.bytes[0].value;
        for offset in memchr_iter(initial, &haystack[..=last]) {
            if self.visit(haystack, offset, multiple, callback) {
                return;
            }
        }
    }

    fn scan_prefix2<F>(&self, haystack: &[u8], last: usize, multiple: bool, callback: &mut F)
    where
        F: FnMut(usize) -> ScanControl,
    {
        let initial = u16::from_le_bytes([self.bytes[0].value, self.bytes[1].value]);
        for offset in 0..=last {
            let word = u16::from_le_bytes([haystack[offset], haystack[offset + 1]]);
            if word == initial && self.visit(haystack, offset, multiple, callback) {
                return;
            }
        }
    }

    fn scan_prefix4<F>(&self, haystack: &[u8], last: usize, multiple: bool, callback: &mut F)
    where
        F: FnMut(usize) -> ScanControl,
    {
        let initial = u32::from_le_bytes([
            self.bytes[0].value,
            self.bytes[1].value,
            self.bytes[2].value,
            self.bytes[3].value,
        ]);
        for offset in 0..=last {
            let w = &haystack[offset..offset + 4];
            let word = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            if word == initial && self.visit(haystack, offset, multiple, callback) {
                return;
            }
        }
    }

    /// Returns true when scanning must stop.
    #[inline]
    fn visit<F>(&self, haystack: &[u8], offset: usize, multiple: bool, callback: &mut F) -> bool
    where
        F: FnMut(usize) -> ScanControl,
    {
        if !self.matches_at(haystack, offset) {
            return false;
        }

        match callback(offset) {
            ScanControl::Stop => true,
            ScanControl::Continue | ScanControl::NoOpinion => !multiple,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.bytes {
            if b.is_exact() {
                write!(f, "{:02X} ", b.value)?;
            } else {
                write!(f, "{} ", WILDCARD)?;
            }
        }
        Ok(())
    }
}

fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some(((hi << 4) | lo) as u8)
}
