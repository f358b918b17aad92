//! The compiled-pattern façade: compile once, run many times.

use std::collections::HashMap;

use crate::engine::{BacktrackEngine, Groups, MatchEngine, ParallelEngine};
use crate::errors::{Error, Result};
use crate::flags::{refuse_flags, Flags};
use crate::graph::Graph;
use crate::parser::{parse, ParserState};

/// A pattern argument: source text or an already compiled expression.
pub enum Pattern<'a> {
    Text(&'a str),
    Compiled(RegExp),
}

impl<'a> From<&'a str> for Pattern<'a> {
    fn from(text: &'a str) -> Pattern<'a> {
        Pattern::Text(text)
    }
}

impl From<RegExp> for Pattern<'static> {
    fn from(re: RegExp) -> Pattern<'static> {
        Pattern::Compiled(re)
    }
}

/// Which evaluator a pattern is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Depth-first with an explicit backtrack stack; complete.
    Backtrack,
    /// Breadth-first lockstep; immune to catastrophic backtracking.
    Parallel,
}

impl EngineKind {
    fn require(self) -> Flags {
        match self {
            EngineKind::Backtrack => BacktrackEngine::REQUIRE,
            EngineKind::Parallel => ParallelEngine::REQUIRE,
        }
    }

    fn reject(self) -> Flags {
        match self {
            EngineKind::Backtrack => BacktrackEngine::REJECT,
            EngineKind::Parallel => ParallelEngine::REJECT,
        }
    }
}

/// A compiled regular expression.
pub struct RegExp {
    source: String,
    state: ParserState,
    graph: Graph,
    engine: EngineKind,
}

impl RegExp {
    pub fn new(expr: &str) -> Result<RegExp> {
        RegExp::with_flags(expr, Flags::empty())
    }

    pub fn with_flags(expr: &str, flags: Flags) -> Result<RegExp> {
        RegExp::with_engine(expr, flags, EngineKind::Backtrack)
    }

    /// The usual `compile(pattern, flags)` entry point. An already
    /// compiled pattern passes through, but handing flags along with it
    /// is refused.
    pub fn compile<'a>(pattern: impl Into<Pattern<'a>>, flags: Flags) -> Result<RegExp> {
        match pattern.into() {
            Pattern::Text(expr) => RegExp::with_flags(expr, flags),
            Pattern::Compiled(re) => {
                refuse_flags(flags, Flags::all())?;
                Ok(re)
            }
        }
    }

    /// Compile for a specific engine. The engine's flag contract is
    /// applied to the requested flags before parsing.
    pub fn with_engine(expr: &str, flags: Flags, engine: EngineKind) -> Result<RegExp> {
        let flags = (flags | engine.require()) & !engine.reject();
        let (state, graph) = parse(expr, flags)?;
        Ok(RegExp {
            source: expr.to_string(),
            state,
            graph,
            engine,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> Flags {
        self.state.flags()
    }

    /// Number of capturing groups, excluding group 0.
    pub fn group_count(&self) -> usize {
        self.state.group_count()
    }

    /// Run the configured engine. A restricted engine refusing the graph
    /// falls back to the backtracking engine, which is complete.
    fn run(&self, chars: &[char], pos: usize, search: bool) -> Result<Option<Groups>> {
        match self.engine {
            EngineKind::Backtrack => {
                BacktrackEngine::new(&self.state, &self.graph, chars).run(pos, search)
            }
            EngineKind::Parallel => {
                let result =
                    ParallelEngine::new(&self.state, &self.graph, chars, true).run(pos, search);
                match result {
                    Err(Error::UnsupportedOperation(_)) => {
                        BacktrackEngine::new(&self.state, &self.graph, chars).run(pos, search)
                    }
                    other => other,
                }
            }
        }
    }

    pub fn is_match(&self, text: &str) -> Result<bool> {
        let chars: Vec<char> = text.chars().collect();
        Ok(self.run(&chars, 0, true)?.is_some())
    }

    /// Anchored match at the given character offset.
    pub fn match_at<'t>(&self, text: &'t str, pos: usize) -> Result<Option<RegExpMatch<'t>>> {
        let chars: Vec<char> = text.chars().collect();
        Ok(self.run(&chars, pos, false)?.map(|g| RegExpMatch::new(text, g)))
    }

    /// First match anywhere at or after the start of the subject.
    pub fn find<'t>(&self, text: &'t str) -> Result<Option<RegExpMatch<'t>>> {
        self.find_at(text, 0)
    }

    pub fn find_at<'t>(&self, text: &'t str, pos: usize) -> Result<Option<RegExpMatch<'t>>> {
        let chars: Vec<char> = text.chars().collect();
        Ok(self.run(&chars, pos, true)?.map(|g| RegExpMatch::new(text, g)))
    }

    /// Iterator over non-overlapping matches, left to right.
    pub fn find_iter<'r, 't>(&'r self, text: &'t str) -> Matches<'r, 't> {
        Matches {
            re: self,
            text,
            chars: text.chars().collect(),
            pos: 0,
            done: false,
        }
    }

    /// The pieces of the subject between matches.
    pub fn split<'t>(&self, text: &'t str) -> Result<Vec<&'t str>> {
        let mut out = vec![];
        let mut last = 0;
        for m in self.find_iter(text) {
            let m = m?;
            let (start, end) = match m.byte_span(0) {
                Some(span) => span,
                None => continue,
            };
            if start == end {
                continue;
            }
            out.push(&text[last..start]);
            last = end;
        }
        out.push(&text[last..]);
        Ok(out)
    }

    /// Replace the first match using a template; see `expand_template`.
    pub fn replace(&self, text: &str, template: &str) -> Result<String> {
        self.replace_count(text, template, Some(1))
    }

    /// Replace every match using a template.
    pub fn replace_all(&self, text: &str, template: &str) -> Result<String> {
        self.replace_count(text, template, None)
    }

    fn replace_count(&self, text: &str, template: &str, limit: Option<usize>) -> Result<String> {
        let template = Template::parse(template)?;
        let mut out = String::new();
        let mut last = 0;
        let mut seen = 0;
        for m in self.find_iter(text) {
            if limit.map_or(false, |limit| seen >= limit) {
                break;
            }
            let m = m?;
            let (start, end) = match m.byte_span(0) {
                Some(span) => span,
                None => continue,
            };
            out.push_str(&text[last..start]);
            template.expand(&m, &mut out)?;
            last = end;
            seen += 1;
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

/// Escape a literal so it can be embedded in a pattern verbatim.
pub fn escape(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len());
    for c in text.chars() {
        if !(c.is_alphanumeric() || c == '_') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// One match of a pattern against a subject.
///
/// Spans are reported in character offsets; slices come straight out of
/// the subject string.
pub struct RegExpMatch<'t> {
    text: &'t str,
    /// Byte offset of each character, plus the end sentinel.
    byte_offsets: Vec<usize>,
    groups: Groups,
}

impl<'t> RegExpMatch<'t> {
    fn new(text: &'t str, groups: Groups) -> RegExpMatch<'t> {
        let mut byte_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        byte_offsets.push(text.len());
        RegExpMatch {
            text,
            byte_offsets,
            groups,
        }
    }

    /// The whole matched text.
    pub fn as_str(&self) -> &'t str {
        self.group(0).ok().flatten().unwrap_or("")
    }

    /// The text of a group, `None` when the group did not participate.
    pub fn group(&self, number: usize) -> Result<Option<&'t str>> {
        self.check(number)?;
        Ok(self
            .byte_span(number)
            .map(|(start, end)| &self.text[start..end]))
    }

    /// The text of a named group.
    pub fn group_name(&self, name: &str) -> Result<Option<&'t str>> {
        match self.groups.index_of(name) {
            Some(number) => self.group(number),
            None => Err(Error::Value(format!("no such group: {}", name))),
        }
    }

    pub fn start(&self, number: usize) -> Result<Option<usize>> {
        Ok(self.span(number)?.map(|(start, _)| start))
    }

    pub fn end(&self, number: usize) -> Result<Option<usize>> {
        Ok(self.span(number)?.map(|(_, end)| end))
    }

    /// Character-offset span of a group.
    pub fn span(&self, number: usize) -> Result<Option<(usize, usize)>> {
        self.check(number)?;
        Ok(self.groups.span(number))
    }

    /// The texts of all capturing groups, in index order.
    pub fn groups(&self) -> Vec<Option<&'t str>> {
        (1..=self.groups.count())
            .map(|i| self.byte_span(i).map(|(s, e)| &self.text[s..e]))
            .collect()
    }

    /// Named groups and their texts.
    pub fn group_dict(&self) -> HashMap<String, Option<&'t str>> {
        let mut out = HashMap::new();
        for i in 1..=self.groups.count() {
            if let Some(name) = self.groups.name_of(i) {
                out.insert(
                    name.to_string(),
                    self.byte_span(i).map(|(s, e)| &self.text[s..e]),
                );
            }
        }
        out
    }

    /// Index of the last closed capturing group.
    pub fn last_index(&self) -> Option<usize> {
        self.groups.last_index()
    }

    /// Name of the last closed capturing group, if named.
    pub fn last_group(&self) -> Option<&str> {
        self.groups.last_group()
    }

    fn check(&self, number: usize) -> Result<()> {
        if number > self.groups.count() {
            return Err(Error::Index(number));
        }
        Ok(())
    }

    fn byte_span(&self, number: usize) -> Option<(usize, usize)> {
        self.groups
            .span(number)
            .map(|(start, end)| (self.byte_offsets[start], self.byte_offsets[end]))
    }
}

/// Iterator over non-overlapping matches. An empty match advances the
/// scan by one character so the iteration always terminates.
pub struct Matches<'r, 't> {
    re: &'r RegExp,
    text: &'t str,
    chars: Vec<char>,
    pos: usize,
    done: bool,
}

impl<'r, 't> Iterator for Matches<'r, 't> {
    type Item = Result<RegExpMatch<'t>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos > self.chars.len() {
            return None;
        }
        match self.re.run(&self.chars, self.pos, true) {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(groups)) => {
                let (start, end) = match groups.span(0) {
                    Some(span) => span,
                    None => {
                        self.done = true;
                        return None;
                    }
                };
                self.pos = if start == end { end + 1 } else { end };
                Some(Ok(RegExpMatch::new(self.text, groups)))
            }
        }
    }
}

/// A parsed replacement template: literal runs, numbered references and
/// `\g<name-or-number>` references. Unknown backslash sequences are
/// preserved verbatim.
struct Template {
    parts: Vec<TemplatePart>,
}

enum TemplatePart {
    Literal(String),
    Group(usize),
    Named(String),
}

impl Template {
    fn parse(template: &str) -> Result<Template> {
        let mut parts = vec![];
        let mut literal = String::new();
        let mut it = template.chars().peekable();
        while let Some(c) = it.next() {
            if c != '\\' {
                literal.push(c);
                continue;
            }
            match it.next() {
                None => literal.push('\\'),
                Some(d @ '1'..='9') => {
                    let mut number = d.to_digit(10).map_or(0, |d| d as usize);
                    if let Some(&d2) = it.peek() {
                        if d2.is_ascii_digit() {
                            it.next();
                            number = number * 10 + d2.to_digit(10).map_or(0, |d| d as usize);
                        }
                    }
                    if !literal.is_empty() {
                        parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(TemplatePart::Group(number));
                }
                Some('g') => {
                    if it.next() != Some('<') {
                        return Err(Error::parse("missing < after \\g"));
                    }
                    let mut name = String::new();
                    loop {
                        match it.next() {
                            Some('>') => break,
                            Some(c) => name.push(c),
                            None => return Err(Error::parse("unterminated group name")),
                        }
                    }
                    if name.is_empty() {
                        return Err(Error::parse("empty group name"));
                    }
                    if !literal.is_empty() {
                        parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                    }
                    match name.parse::<usize>() {
                        Ok(number) => parts.push(TemplatePart::Group(number)),
                        Err(_) => parts.push(TemplatePart::Named(name)),
                    }
                }
                Some('n') => literal.push('\n'),
                Some('r') => literal.push('\r'),
                Some('t') => literal.push('\t'),
                Some('\\') => literal.push('\\'),
                Some(other) => {
                    // unknown escapes pass through untouched
                    literal.push('\\');
                    literal.push(other);
                }
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Template { parts })
    }

    fn expand(&self, m: &RegExpMatch<'_>, out: &mut String) -> Result<()> {
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Group(number) => {
                    if let Some(text) = m.group(*number)? {
                        out.push_str(text);
                    }
                }
                TemplatePart::Named(name) => {
                    if let Some(text) = m.group_name(name)? {
                        out.push_str(text);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_groups_test() -> Result<()> {
        let re = RegExp::new("a(b)c")?;
        let m = re.match_at("abc", 0)?.unwrap();
        assert_eq!(m.group(0)?, Some("abc"));
        assert_eq!(m.group(1)?, Some("b"));
        assert_eq!(m.span(1)?, Some((1, 2)));
        assert!(m.group(2).is_err());
        Ok(())
    }

    #[test]
    fn named_groups_test() -> Result<()> {
        let re = RegExp::new(r"(?P<w>\w+)\s+(?P=w)")?;
        let m = re.find("the the end")?.unwrap();
        assert_eq!(m.group(0)?, Some("the the"));
        assert_eq!(m.group_name("w")?, Some("the"));
        assert!(m.group_name("nope").is_err());
        assert_eq!(m.last_group(), Some("w"));
        Ok(())
    }

    #[test]
    fn groups_and_dict_test() -> Result<()> {
        let re = RegExp::new(r"(a)(?P<mid>b)?(c)")?;
        let m = re.match_at("ac", 0)?.unwrap();
        assert_eq!(m.groups(), vec![Some("a"), None, Some("c")]);
        let dict = m.group_dict();
        assert_eq!(dict.get("mid"), Some(&None));
        assert_eq!(m.last_index(), Some(3));
        Ok(())
    }

    #[test]
    fn engines_share_the_surface_test() -> Result<()> {
        for &kind in &[EngineKind::Backtrack, EngineKind::Parallel] {
            let re = RegExp::with_engine(r"\d{2,4}", Flags::empty(), kind)?;
            let m = re.find("xx12345yy")?.unwrap();
            assert_eq!(m.group(0)?, Some("1234"));
            assert_eq!(m.span(0)?, Some((2, 6)));
        }
        Ok(())
    }

    #[test]
    fn engine_fallback_test() -> Result<()> {
        // a graph with multi-character strings handed to the lockstep
        // engine: it refuses, and the façade silently falls back
        let (state, graph) = parse("abc", Flags::STRINGS)?;
        let re = RegExp {
            source: "abc".to_string(),
            state,
            graph,
            engine: EngineKind::Parallel,
        };
        assert!(re.is_match("xabcx")?);
        Ok(())
    }

    #[test]
    fn unicode_subject_test() -> Result<()> {
        let re = RegExp::new("é(ß)")?;
        let m = re.find("xéßy")?.unwrap();
        // spans are character offsets, slices are real subslices
        assert_eq!(m.span(0)?, Some((1, 3)));
        assert_eq!(m.group(1)?, Some("ß"));
        Ok(())
    }

    #[test]
    fn find_iter_test() -> Result<()> {
        let re = RegExp::new(r"\d+")?;
        let spans: Vec<_> = re
            .find_iter("a1bb22ccc333")
            .map(|m| m.unwrap().span(0).unwrap().unwrap())
            .collect();
        assert_eq!(spans, vec![(1, 2), (4, 6), (9, 12)]);
        Ok(())
    }

    #[test]
    fn find_iter_empty_match_test() -> Result<()> {
        let re = RegExp::new("x*")?;
        let count = re.find_iter("axa").count();
        // terminates despite matching emptily everywhere
        assert!(count >= 2);
        Ok(())
    }

    #[test]
    fn split_test() -> Result<()> {
        let re = RegExp::new(",")?;
        assert_eq!(re.split("a,b,,c")?, vec!["a", "b", "", "c"]);
        let re = RegExp::new(r"\s+")?;
        assert_eq!(re.split("a b  c")?, vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn replace_test() -> Result<()> {
        let re = RegExp::new(r"(\w+)@(\w+)")?;
        assert_eq!(
            re.replace_all("a@b c@d", r"\2@\1")?,
            "b@a d@c"
        );
        assert_eq!(re.replace("a@b c@d", r"\2@\1")?, "b@a c@d");
        Ok(())
    }

    #[test]
    fn replace_named_template_test() -> Result<()> {
        let re = RegExp::new(r"(?P<user>\w+)@(?P<host>\w+)")?;
        assert_eq!(
            re.replace_all("a@b", r"\g<host>!\g<user>")?,
            "b!a"
        );
        assert_eq!(re.replace_all("a@b", r"\g<2>!\g<1>")?, "b!a");
        Ok(())
    }

    #[test]
    fn replace_preserves_unknown_escapes_test() -> Result<()> {
        let re = RegExp::new("a")?;
        assert_eq!(re.replace_all("a", r"\q\n")?, "\\q\n");
        assert!(re.replace_all("a", r"\g<").is_err());
        Ok(())
    }

    #[test]
    fn escape_test() -> Result<()> {
        assert_eq!(escape("a.b*c"), r"a\.b\*c");
        let re = RegExp::new(&escape("a.b*c"))?;
        assert!(re.match_at("a.b*c", 0)?.is_some());
        assert!(re.match_at("axbbc", 0)?.is_none());
        Ok(())
    }

    #[test]
    fn match_at_is_anchored_test() -> Result<()> {
        let re = RegExp::new("b")?;
        assert!(re.match_at("ab", 0)?.is_none());
        assert!(re.match_at("ab", 1)?.is_some());
        assert!(re.find("ab")?.is_some());
        Ok(())
    }

    #[test]
    fn bad_flag_string_test() {
        assert!(matches!(Flags::parse_from("iz"), Err(Error::Value(_))));
    }

    #[test]
    fn anchored_match_equals_caret_search_test() -> Result<()> {
        let cases: &[(&str, &str)] = &[
            ("abc", "abcd"),
            ("abc", "xabc"),
            (r"\d+", "123"),
            (r"\d+", "x123"),
            ("a|ab", "ab"),
            ("x*y", "yy"),
            ("x*y", "zy"),
        ];
        for &(pattern, text) in cases {
            let plain = RegExp::new(pattern)?;
            let anchored = RegExp::new(&format!("^{}", pattern))?;
            assert_eq!(
                plain.match_at(text, 0)?.is_some(),
                anchored.find(text)?.is_some(),
                "match/search disagree for {:?} on {:?}",
                pattern,
                text
            );
        }
        Ok(())
    }

    #[test]
    fn compile_refuses_flags_on_compiled_test() -> Result<()> {
        let re = RegExp::compile("ab", Flags::IGNORECASE)?;
        let re = RegExp::compile(re, Flags::empty())?;
        assert!(re.is_match("AB")?);

        let re = RegExp::new("ab")?;
        assert!(matches!(
            RegExp::compile(re, Flags::IGNORECASE),
            Err(Error::Value(_))
        ));
        Ok(())
    }
}
