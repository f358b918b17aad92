use crate::charset::CharSet;
use crate::errors::{Error, Result};
use crate::flags::Flags;

/// Result of unpacking a literal character against the current flags.
///
/// Under `IGNORECASE` a cased character expands to the set of its case
/// equivalents; everything else stays a plain character.
pub enum Unpacked {
    Single(char),
    Set(CharSet),
}

/// A bounded, totally ordered character universe.
///
/// Characters are identified with a contiguous code range `[min, max]`
/// (some codes may be holes, e.g. surrogates); `before`/`after` step over
/// holes. Predicates classify characters for `\d`, `\s` and `\w`.
pub trait Alphabet {
    fn min_code(&self) -> u32;

    fn max_code(&self) -> u32;

    /// The character for a code, or `None` for holes in the range.
    fn code_to_char(&self, code: u32) -> Option<char>;

    /// The smallest character of the alphabet.
    fn min_char(&self) -> char;

    /// The largest character of the alphabet.
    fn max_char(&self) -> char;

    fn char_to_code(&self, c: char) -> u32 {
        c as u32
    }

    /// Check that a character is a member of this alphabet.
    fn coerce(&self, c: char) -> Result<char> {
        let code = self.char_to_code(c);
        if code < self.min_code() || code > self.max_code() {
            Err(Error::Value(format!("character {:?} outside alphabet", c)))
        } else {
            Ok(c)
        }
    }

    /// The character after the given one, or `None` at the upper bound.
    fn after(&self, c: char) -> Option<char> {
        let mut code = self.char_to_code(c);
        while code < self.max_code() {
            code += 1;
            if let Some(next) = self.code_to_char(code) {
                return Some(next);
            }
        }
        None
    }

    /// The character before the given one, or `None` at the lower bound.
    fn before(&self, c: char) -> Option<char> {
        let mut code = self.char_to_code(c);
        while code > self.min_code() {
            code -= 1;
            if let Some(prev) = self.code_to_char(code) {
                return Some(prev);
            }
        }
        None
    }

    fn digit(&self, c: char) -> bool;

    fn space(&self, c: char) -> bool;

    fn word(&self, c: char) -> bool;

    /// Unpack a literal for the given flags; see `Unpacked`.
    fn unpack(&self, c: char, flags: Flags) -> Result<Unpacked> {
        let c = self.coerce(c)?;
        if flags.contains(Flags::IGNORECASE) {
            let (lo, hi) = self.case_pair(c);
            if lo != hi {
                let mut set = CharSet::empty();
                set.append((lo, lo), self)?;
                set.append((hi, hi), self)?;
                return Ok(Unpacked::Set(set));
            }
        }
        Ok(Unpacked::Single(c))
    }

    /// The lower/upper case forms of a character (equal when uncased or
    /// when the mapping is not a single character).
    fn case_pair(&self, c: char) -> (char, char) {
        let mut lower = c.to_lowercase();
        let mut upper = c.to_uppercase();
        let lo = match (lower.next(), lower.next()) {
            (Some(l), None) => l,
            _ => c,
        };
        let hi = match (upper.next(), upper.next()) {
            (Some(u), None) => u,
            _ => c,
        };
        (lo, hi)
    }

    /// Map a numeric escape (`\xHH`, `\uHHHH`, octal) to a character.
    fn unescape(&self, code: u32) -> Result<char> {
        if code >= self.min_code() && code <= self.max_code() {
            if let Some(c) = self.code_to_char(code) {
                return Ok(c);
            }
        }
        Err(Error::parse(format!("bad character code: {:#x}", code)))
    }
}

/// The code points 0..=127.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ascii;

impl Alphabet for Ascii {
    fn min_code(&self) -> u32 {
        0
    }

    fn max_code(&self) -> u32 {
        0x7f
    }

    fn code_to_char(&self, code: u32) -> Option<char> {
        if code <= 0x7f {
            std::char::from_u32(code)
        } else {
            None
        }
    }

    fn min_char(&self) -> char {
        '\u{0}'
    }

    fn max_char(&self) -> char {
        '\u{7f}'
    }

    fn digit(&self, c: char) -> bool {
        c.is_ascii_digit()
    }

    fn space(&self, c: char) -> bool {
        matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')
    }

    fn word(&self, c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }
}

/// All Unicode scalar values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unicode;

impl Alphabet for Unicode {
    fn min_code(&self) -> u32 {
        0
    }

    fn max_code(&self) -> u32 {
        0x10ffff
    }

    fn code_to_char(&self, code: u32) -> Option<char> {
        std::char::from_u32(code)
    }

    fn min_char(&self) -> char {
        '\u{0}'
    }

    fn max_char(&self) -> char {
        std::char::MAX
    }

    fn digit(&self, c: char) -> bool {
        c.is_numeric()
    }

    fn space(&self, c: char) -> bool {
        c.is_whitespace()
    }

    fn word(&self, c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }
}
