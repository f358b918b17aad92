use bitflags::bitflags;

use crate::errors::{Error, Result};

bitflags! {
    /// Pattern compilation flags.
    ///
    /// The public flags mirror the usual single-letter spellings and can
    /// also be set inline with `(?imsuxa)`. The underscore-prefixed bits
    /// are internal tuning knobs: engines request or refuse them when a
    /// pattern is compiled on their behalf.
    pub struct Flags: u16 {
        const IGNORECASE   = 1 << 0;
        const MULTILINE    = 1 << 1;
        const DOTALL       = 1 << 2;
        const UNICODE      = 1 << 3;
        const VERBOSE      = 1 << 4;
        const ASCII        = 1 << 5;
        /// Expand `{n,m}` counts by cloning instead of a runtime counter.
        const LOOP_UNROLL  = 1 << 6;
        /// The target engine accepts multi-character string opcodes.
        const STRINGS      = 1 << 7;
        /// Suppress empty-loop checkpoints and the empty-repeat check.
        const UNSAFE       = 1 << 8;
    }
}

impl Flags {
    pub const I: Flags = Flags::IGNORECASE;
    pub const M: Flags = Flags::MULTILINE;
    pub const S: Flags = Flags::DOTALL;
    pub const U: Flags = Flags::UNICODE;
    pub const X: Flags = Flags::VERBOSE;
    pub const A: Flags = Flags::ASCII;

    /// Parse a run of single-letter flags, e.g. `"im"`.
    pub fn parse_from(s: &str) -> Result<Flags> {
        let mut val = Flags::empty();
        for c in s.chars() {
            val |= Flags::from_letter(c)
                .ok_or_else(|| Error::Value(format!("unknown flag character: {}", c)))?;
        }
        Ok(val)
    }

    /// The flag named by a single inline-flag letter, if any.
    pub fn from_letter(c: char) -> Option<Flags> {
        Some(match c {
            'i' => Flags::IGNORECASE,
            'm' => Flags::MULTILINE,
            's' => Flags::DOTALL,
            'u' => Flags::UNICODE,
            'x' => Flags::VERBOSE,
            'a' => Flags::ASCII,
            _ => return None,
        })
    }

    /// Names of the set flags, for error messages.
    pub fn names(&self) -> Vec<&'static str> {
        const TABLE: &[(Flags, &str)] = &[
            (Flags::IGNORECASE, "I/IGNORECASE"),
            (Flags::MULTILINE, "M/MULTILINE"),
            (Flags::DOTALL, "S/DOTALL"),
            (Flags::UNICODE, "U/UNICODE"),
            (Flags::VERBOSE, "X/VERBOSE"),
            (Flags::ASCII, "A/ASCII"),
            (Flags::LOOP_UNROLL, "_L/LOOP_UNROLL"),
            (Flags::STRINGS, "_S/STRINGS"),
            (Flags::UNSAFE, "_U/UNSAFE"),
        ];
        TABLE
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
            .collect()
    }
}

/// Fail if any of the given flags are set. Used by surfaces that accept a
/// flag argument but only support a subset.
pub fn refuse_flags(flags: Flags, refused: Flags) -> Result<()> {
    let bad = flags & refused;
    if !bad.is_empty() {
        return Err(Error::Value(format!("bad flags: {}", bad.names().join("; "))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_from_test() -> Result<()> {
        assert_eq!(Flags::parse_from("im")?, Flags::IGNORECASE | Flags::MULTILINE);
        assert_eq!(Flags::parse_from("")?, Flags::empty());
        assert!(Flags::parse_from("z").is_err());
        Ok(())
    }

    #[test]
    fn refuse_flags_test() {
        assert!(refuse_flags(Flags::MULTILINE, Flags::MULTILINE).is_err());
        assert!(refuse_flags(Flags::MULTILINE, Flags::IGNORECASE).is_ok());
    }
}
