//! Byte-pattern compilation and scanning.
//!
//! Patterns use the conventional text form `"48 8B ?? C1"`: whitespace
//! separated tokens, each either two hex digits or a wildcard (`?` / `??`).
//! Wildcards are represented as `None` internally, so no byte value can be
//! mistaken for one while scanning.

mod set;

pub use set::{PatternEntry, PatternSet, load_pattern_set, save_pattern_set};

use std::fmt;

use crate::error::{Error, Result};

/// A compiled byte pattern. Immutable once parsed; never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    elements: Vec<Option<u8>>,
}

impl Pattern {
    /// Compile pattern text into a scan template.
    ///
    /// Any malformed token aborts the whole parse; a pattern of length zero
    /// is never produced.
    pub fn parse(text: &str) -> Result<Self> {
        let mut elements = Vec::new();

        for token in text.split_whitespace() {
            if token == "??" || token == "?" {
                elements.push(None);
                continue;
            }

            if token.len() != 2 {
                return Err(Error::InvalidPatternToken {
                    token: token.to_string(),
                    reason: "expected exactly two hex digits".to_string(),
                });
            }

            let value = u8::from_str_radix(token, 16).map_err(|e| Error::InvalidPatternToken {
                token: token.to_string(),
                reason: e.to_string(),
            })?;
            elements.push(Some(value));
        }

        if elements.is_empty() {
            return Err(Error::EmptyPattern);
        }

        Ok(Self { elements })
    }

    /// Number of elements (bytes) the pattern spans.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Always false for a parsed pattern; kept for API completeness.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[Option<u8>] {
        &self.elements
    }

    /// Offset of the first (lowest) match in `buffer`, if any.
    ///
    /// A buffer shorter than the pattern yields `None`, never a fault.
    pub fn find(&self, buffer: &[u8]) -> Option<usize> {
        self.candidates(buffer).next()
    }

    /// Offsets of every match in `buffer`, ascending.
    pub fn find_all(&self, buffer: &[u8]) -> Vec<usize> {
        self.candidates(buffer).collect()
    }

    fn matches_at(&self, buffer: &[u8], start: usize) -> bool {
        self.elements
            .iter()
            .zip(&buffer[start..start + self.elements.len()])
            .all(|(element, byte)| match element {
                Some(value) => value == byte,
                None => true,
            })
    }

    /// Candidate starts are narrowed with memchr on the first fixed byte;
    /// a fully wildcarded pattern matches at every viable offset.
    fn candidates<'a>(&'a self, buffer: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let len = self.elements.len();
        let viable = buffer.len().checked_sub(len).map(|last| last + 1).unwrap_or(0);

        let anchor = self
            .elements
            .iter()
            .enumerate()
            .find_map(|(idx, element)| element.map(|byte| (idx, byte)));

        PatternMatches {
            pattern: self,
            buffer,
            inner: match anchor {
                Some((idx, needle)) if viable > 0 => CandidateIter::Anchored {
                    iter: memchr::memchr_iter(needle, &buffer[idx..idx + viable]),
                },
                Some(_) => CandidateIter::Exhausted,
                None => CandidateIter::Every { next: 0, end: viable },
            },
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match element {
                Some(value) => write!(f, "{:02X}", value)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

enum CandidateIter<'a> {
    Anchored { iter: memchr::Memchr<'a> },
    Every { next: usize, end: usize },
    Exhausted,
}

struct PatternMatches<'a> {
    pattern: &'a Pattern,
    buffer: &'a [u8],
    inner: CandidateIter<'a>,
}

impl Iterator for PatternMatches<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let start = match &mut self.inner {
                CandidateIter::Anchored { iter } => iter.next()?,
                CandidateIter::Every { next, end } => {
                    if *next >= *end {
                        return None;
                    }
                    let n = *next;
                    *next += 1;
                    return Some(n);
                }
                CandidateIter::Exhausted => return None,
            };

            if self.pattern.matches_at(self.buffer, start) {
                return Some(start);
            }
        }
    }
}

/// Scan a raw memory range for the first occurrence of `pattern`.
///
/// Returns the absolute address of the match.
///
/// # Safety
///
/// `[base, base + size)` must be readable for the whole duration of the
/// scan; callers are expected to verify this through the region cache
/// before handing the range in.
pub unsafe fn scan_region(base: usize, size: usize, pattern: &Pattern) -> Option<usize> {
    if base == 0 || size == 0 {
        return None;
    }
    let buffer = unsafe { std::slice::from_raw_parts(base as *const u8, size) };
    pattern.find(buffer).map(|offset| base + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_wildcards() {
        let pattern = Pattern::parse("48 8D 0D ?? ?? ?? ??").unwrap();
        assert_eq!(pattern.len(), 7);
        assert_eq!(pattern.elements()[0], Some(0x48));
        assert_eq!(pattern.elements()[3], None);
    }

    #[test]
    fn test_parse_mixed_case() {
        let pattern = Pattern::parse("aB Cd").unwrap();
        assert_eq!(pattern.elements(), &[Some(0xAB), Some(0xCD)]);
    }

    #[test]
    fn test_parse_invalid_hex_token() {
        assert!(matches!(
            Pattern::parse("ZZ"),
            Err(Error::InvalidPatternToken { .. })
        ));
    }

    #[test]
    fn test_parse_odd_length_token() {
        assert!(matches!(
            Pattern::parse("48 8"),
            Err(Error::InvalidPatternToken { .. })
        ));
        assert!(matches!(
            Pattern::parse("488B"),
            Err(Error::InvalidPatternToken { .. })
        ));
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(matches!(Pattern::parse(""), Err(Error::EmptyPattern)));
        assert!(matches!(Pattern::parse("   "), Err(Error::EmptyPattern)));
    }

    #[test]
    fn test_parse_aborts_whole_pattern() {
        // One bad token in the middle yields no pattern at all.
        assert!(Pattern::parse("48 XX 8B").is_err());
    }

    #[test]
    fn test_format_roundtrip() {
        let pattern = Pattern::parse("48 8d 0d ?? FF").unwrap();
        assert_eq!(pattern.to_string(), "48 8D 0D ?? FF");
        let reparsed = Pattern::parse(&pattern.to_string()).unwrap();
        assert_eq!(reparsed, pattern);
    }

    #[test]
    fn test_find_basic() {
        let pattern = Pattern::parse("48 8B ?? C1").unwrap();
        let buffer = [0x10, 0x48, 0x8B, 0x99, 0xC1, 0x20];
        assert_eq!(pattern.find(&buffer), Some(1));
    }

    #[test]
    fn test_wildcard_position_is_indifferent() {
        let pattern = Pattern::parse("AA BB ?? DD").unwrap();
        for filler in [0x00u8, 0xBB, 0xCC, 0xFF] {
            let buffer = [0x01, 0xAA, 0xBB, filler, 0xDD, 0x02];
            assert_eq!(pattern.find(&buffer), Some(1));
        }
    }

    #[test]
    fn test_first_match_wins() {
        let pattern = Pattern::parse("AA BB").unwrap();
        let mut buffer = vec![0u8; 20];
        buffer[5] = 0xAA;
        buffer[6] = 0xBB;
        buffer[12] = 0xAA;
        buffer[13] = 0xBB;
        assert_eq!(pattern.find(&buffer), Some(5));
        assert_eq!(pattern.find_all(&buffer), vec![5, 12]);
    }

    #[test]
    fn test_buffer_shorter_than_pattern() {
        let pattern = Pattern::parse("AA BB CC DD").unwrap();
        assert_eq!(pattern.find(&[0xAA, 0xBB]), None);
        assert_eq!(pattern.find(&[]), None);
    }

    #[test]
    fn test_exact_length_match() {
        let pattern = Pattern::parse("AA BB").unwrap();
        assert_eq!(pattern.find(&[0xAA, 0xBB]), Some(0));
    }

    #[test]
    fn test_all_wildcards_matches_at_zero() {
        let pattern = Pattern::parse("?? ??").unwrap();
        assert_eq!(pattern.find(&[0x12, 0x34, 0x56]), Some(0));
        assert_eq!(pattern.find_all(&[0x12, 0x34, 0x56]), vec![0, 1]);
        assert_eq!(pattern.find(&[0x12]), None);
    }

    #[test]
    fn test_leading_wildcard_anchor() {
        let pattern = Pattern::parse("?? BB CC").unwrap();
        let buffer = [0xBB, 0x00, 0xBB, 0xCC, 0x00];
        assert_eq!(pattern.find(&buffer), Some(1));
    }

    #[test]
    fn test_wildcard_not_confused_with_sentinel_byte() {
        // 0xCC in data must not match a fixed byte, and a wildcard must
        // still match 0xCC.
        let pattern = Pattern::parse("CC ??").unwrap();
        assert_eq!(pattern.find(&[0xCC, 0xCC]), Some(0));
        let fixed = Pattern::parse("AA").unwrap();
        assert_eq!(fixed.find(&[0xCC]), None);
    }

    #[test]
    fn test_scan_region_absolute_address() {
        let buffer = [0x10u8, 0x48, 0x8B, 0x99, 0xC1, 0x20];
        let pattern = Pattern::parse("48 8B ?? C1").unwrap();
        let base = buffer.as_ptr() as usize;
        let found = unsafe { scan_region(base, buffer.len(), &pattern) };
        assert_eq!(found, Some(base + 1));
    }

    #[test]
    fn test_scan_region_null_or_empty() {
        let pattern = Pattern::parse("48").unwrap();
        assert_eq!(unsafe { scan_region(0, 16, &pattern) }, None);
        let buffer = [0u8; 4];
        assert_eq!(
            unsafe { scan_region(buffer.as_ptr() as usize, 0, &pattern) },
            None
        );
    }
}
