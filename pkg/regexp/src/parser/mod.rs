mod builders;

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::alphabet::{Alphabet, Ascii, Unicode};
use crate::errors::{Error, Result};
use crate::flags::Flags;
use crate::graph::{Graph, Op};

/// Everything the parser accumulates besides the graph itself: the
/// alphabet, the effective flag set, the capture group numbering and the
/// name tables. The engines keep a reference to this after compilation.
pub struct ParserState {
    alphabet: Rc<dyn Alphabet>,
    flags: Flags,
    new_flags: Flags,
    group_count: usize,
    name_to_index: Rc<HashMap<String, usize>>,
    index_to_name: Rc<HashMap<usize, String>>,
}

impl ParserState {
    pub fn new(flags: Flags) -> Result<ParserState> {
        let mut flags = flags;
        // default is unicode
        if !flags.intersects(Flags::ASCII | Flags::UNICODE) {
            flags |= Flags::UNICODE;
        }
        if flags.contains(Flags::ASCII | Flags::UNICODE) {
            return Err(Error::parse("cannot specify unicode and ascii together"));
        }
        let alphabet: Rc<dyn Alphabet> = if flags.contains(Flags::ASCII) {
            Rc::new(Ascii)
        } else {
            Rc::new(Unicode)
        };
        Ok(ParserState {
            alphabet,
            flags,
            new_flags: Flags::empty(),
            group_count: 0,
            name_to_index: Rc::new(HashMap::new()),
            index_to_name: Rc::new(HashMap::new()),
        })
    }

    /// Allocate the next group number; groups are numbered from 1 in the
    /// order their opening parenthesis is seen.
    pub fn next_group(&mut self, name: Option<&str>) -> Result<usize> {
        self.group_count += 1;
        if let Some(name) = name {
            if self.name_to_index.contains_key(name) {
                return Err(Error::parse(format!("duplicate group name: {}", name)));
            }
            Rc::make_mut(&mut self.name_to_index).insert(name.to_string(), self.group_count);
            Rc::make_mut(&mut self.index_to_name).insert(self.group_count, name.to_string());
        }
        Ok(self.group_count)
    }

    pub fn index_for_name(&self, name: &str) -> Result<usize> {
        self.name_to_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::parse(format!("unknown group name: {}", name)))
    }

    /// Resolve either a plain number or a group name.
    pub fn index_for_name_or_number(&self, name: &str) -> Result<usize> {
        if name.is_empty() {
            return Err(Error::parse("empty group name"));
        }
        match name.parse::<usize>() {
            Ok(n) => Ok(n),
            Err(_) => self.index_for_name(name),
        }
    }

    /// Record a flag requested by an inline `(?...)` group. The flag only
    /// takes effect on the restart pass.
    pub fn new_flag(&mut self, flag: Flags) {
        self.new_flags |= flag;
    }

    pub fn alphabet(&self) -> &dyn Alphabet {
        self.alphabet.as_ref()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn new_flags(&self) -> Flags {
        self.new_flags
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }

    pub fn group_names(&self) -> Rc<HashMap<String, usize>> {
        self.name_to_index.clone()
    }

    pub fn group_indices(&self) -> Rc<HashMap<usize, String>> {
        self.index_to_name.clone()
    }
}

/// Parse a pattern into its instruction graph.
///
/// Inline flags may request bits that were not active when parsing
/// started; in that case the whole pattern is reparsed once with the
/// union. A second wave of new flags means the flag set cannot converge.
pub fn parse(text: &str, flags: Flags) -> Result<(ParserState, Graph)> {
    let mut state = ParserState::new(flags)?;
    let mut graph = builders::run(text, &mut state)?;
    if !(state.new_flags() & !state.flags()).is_empty() {
        let requested = flags | state.new_flags();
        debug!("restarting parse with inline flags: {:?}", requested);
        state = ParserState::new(requested)?;
        graph = builders::run(text, &mut state)?;
        if !(state.new_flags() & !state.flags()).is_empty() {
            return Err(Error::parse("inconsistent flags"));
        }
    }
    validate_references(&state, &graph)?;
    debug!("parsed {:?} into {} nodes", text, graph.len());
    Ok((state, graph))
}

/// Backreferences may run ahead of the group they name, but the group has
/// to exist somewhere in the pattern.
fn validate_references(state: &ParserState, graph: &Graph) -> Result<()> {
    for op in graph.ops() {
        let number = match op {
            Op::GroupReference(n) | Op::Conditional(n) => *n,
            _ => continue,
        };
        if number == 0 || number > state.group_count() {
            return Err(Error::parse(format!("unknown group: {}", number)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembly(pattern: &str) -> String {
        let (state, graph) = parse(pattern, Flags::empty()).unwrap();
        graph.assembly(state.alphabet())
    }

    #[test]
    fn literal_sequence_test() {
        assert_eq!(
            assembly("abc"),
            "  0: match\n  1: str \"c\" -> 0\n  2: str \"b\" -> 1\n  3: str \"a\" -> 2\n"
        );
    }

    #[test]
    fn strings_flag_coalesces_test() {
        let (state, graph) = parse("abc", Flags::STRINGS).unwrap();
        assert_eq!(
            graph.assembly(state.alphabet()),
            "  0: match\n  1: str \"abc\" -> 0\n"
        );
    }

    #[test]
    fn alternation_test() {
        let (state, graph) = parse("a|b", Flags::empty()).unwrap();
        let listing = graph.assembly(state.alphabet());
        assert!(listing.contains("split"), "{}", listing);
        // first alternative is the split's first successor
        let entry = graph.entry();
        let first = graph.next(entry)[0];
        assert!(matches!(graph.op(first), Op::Str(t) if t.as_str() == "a"));
    }

    #[test]
    fn group_numbering_test() {
        let (state, _) = parse("(a)(?:b)((c))", Flags::empty()).unwrap();
        assert_eq!(state.group_count(), 3);
    }

    #[test]
    fn named_group_test() {
        let (state, _) = parse("(?P<first>a)(?P<second>b)", Flags::empty()).unwrap();
        assert_eq!(state.index_for_name("first").unwrap(), 1);
        assert_eq!(state.index_for_name("second").unwrap(), 2);
        assert!(state.index_for_name("third").is_err());
    }

    #[test]
    fn duplicate_group_name_test() {
        assert!(matches!(
            parse("(?P<x>a)(?P<x>b)", Flags::empty()),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn forward_reference_test() {
        // referencing a later group is fine as long as it exists
        assert!(parse(r"(?:\2x)?(a)(b)", Flags::empty()).is_ok());
        assert!(matches!(
            parse(r"(a)\2", Flags::empty()),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn inline_flags_restart_test() {
        let (state, _) = parse("(?i)abc", Flags::empty()).unwrap();
        assert!(state.flags().contains(Flags::IGNORECASE));
        let (state, _) = parse("(?ms)x", Flags::empty()).unwrap();
        assert!(state.flags().contains(Flags::MULTILINE | Flags::DOTALL));
    }

    #[test]
    fn ascii_unicode_conflict_test() {
        assert!(parse("x", Flags::ASCII | Flags::UNICODE).is_err());
        assert!(parse("x", Flags::ASCII).is_ok());
    }

    #[test]
    fn unbalanced_test() {
        assert!(parse(")", Flags::empty()).is_err());
        assert!(parse("(a", Flags::empty()).is_err());
        assert!(parse("a)", Flags::empty()).is_err());
        assert!(parse("[ab", Flags::empty()).is_err());
        assert!(parse("a{2", Flags::empty()).is_err());
    }

    #[test]
    fn bad_repeat_range_test() {
        assert!(matches!(
            parse("a{3,2}", Flags::empty()),
            Err(Error::Parse(_))
        ));
        assert!(parse("a{2,3}", Flags::empty()).is_ok());
    }

    #[test]
    fn nothing_to_repeat_test() {
        assert!(parse("*a", Flags::empty()).is_err());
        assert!(parse("{2}", Flags::empty()).is_err());
    }

    #[test]
    fn empty_repeat_test() {
        assert!(matches!(
            parse(r"\b+", Flags::empty()),
            Err(Error::Empty(_))
        ));
        assert!(parse(r"\b+", Flags::UNSAFE).is_ok());
        // an alternative that can consume is allowed, guarded by a checkpoint
        let (state, graph) = parse("(a|)*", Flags::empty()).unwrap();
        assert!(graph.assembly(state.alphabet()).contains("checkpoint"));
    }

    #[test]
    fn counted_repeat_shapes_test() {
        let (state, graph) = parse("a{2,4}", Flags::empty()).unwrap();
        let listing = graph.assembly(state.alphabet());
        assert!(listing.contains("repeat 2, 4"), "{}", listing);

        let (state, graph) = parse("a{2,4}", Flags::LOOP_UNROLL).unwrap();
        let listing = graph.assembly(state.alphabet());
        assert!(!listing.contains("repeat"), "{}", listing);
    }

    #[test]
    fn charset_simplifies_test() {
        // single-character class collapses to a literal
        let listing = assembly("[a]");
        assert!(listing.contains("str \"a\""), "{}", listing);

        let listing = assembly("[ab]");
        assert!(listing.contains("char [ab]"), "{}", listing);
    }

    #[test]
    fn lookahead_shape_test() {
        let listing = assembly("a(?=b)c");
        assert!(listing.contains("lookahead"), "{}", listing);

        let listing = assembly("(?<!x)y");
        assert!(listing.contains("lookbehind negative"), "{}", listing);
        // lookbehind sub-pattern scans backwards over an implicit dot-star
        // and is anchored at the cut point
        assert!(listing.contains("end-of-text"), "{}", listing);
    }

    #[test]
    fn conditional_shape_test() {
        let listing = assembly("(a)?(?(1)b|c)");
        assert!(listing.contains("conditional 1"), "{}", listing);

        assert!(parse("(?(2)a)", Flags::empty()).is_err());
        assert!(parse("(a)(?(1)b)", Flags::empty()).is_ok());
    }

    #[test]
    fn comment_group_test() {
        assert_eq!(assembly("a(?#ignored)b"), assembly("ab"));
    }

    #[test]
    fn escapes_test() {
        let listing = assembly(r"\x41\t");
        assert!(listing.contains("str \"A\""), "{}", listing);
        assert!(listing.contains("str \"\\t\""), "{}", listing);

        let listing = assembly(r"\u0041");
        assert!(listing.contains("str \"A\""), "{}", listing);

        // three octal digits form a character, fewer still work
        let listing = assembly(r"\101");
        assert!(listing.contains("str \"A\""), "{}", listing);

        assert!(parse(r"\q", Flags::empty()).is_err());
        assert!(parse(r"\x4", Flags::empty()).is_err());
    }

    #[test]
    fn class_escape_test() {
        let listing = assembly(r"\d\S\w\B");
        assert!(listing.contains("digit"), "{}", listing);
        assert!(listing.contains("space inverted"), "{}", listing);
        assert!(listing.contains("word"), "{}", listing);
        assert!(listing.contains("word-boundary inverted"), "{}", listing);
    }

    #[test]
    fn anchors_test() {
        let listing = assembly(r"^a$\A\Z");
        assert!(listing.contains("start-of-line"), "{}", listing);
        assert!(listing.contains("end-of-line"), "{}", listing);
        assert!(listing.contains("end-of-text"), "{}", listing);
    }

    #[test]
    fn verbose_mode_test() {
        let (_, verbose) = parse("a b  # trailing comment\nc", Flags::VERBOSE).unwrap();
        let (_, plain) = parse("abc", Flags::VERBOSE).unwrap();
        assert_eq!(verbose.len(), plain.len());
    }

    #[test]
    fn ignorecase_literal_test() {
        let listing = {
            let (state, graph) = parse("a9", Flags::IGNORECASE).unwrap();
            graph.assembly(state.alphabet())
        };
        // cased literals become two-character classes, uncased stay strings
        assert!(listing.contains("char [Aa]"), "{}", listing);
        assert!(listing.contains("str \"9\""), "{}", listing);
    }
}
