//! The depth-first evaluator.
//!
//! One state record walks the graph; every choice point pushes a
//! `(node, state)` snapshot onto an explicit fallback stack, so the host
//! stack stays flat no matter how the pattern backtracks. Failure pops
//! the stack; an empty stack in search mode re-anchors one character
//! further right.

use std::collections::HashMap;

use log::trace;

use crate::engine::support::{
    char_in_class, chars_eq, lookahead_logic, CheckPoints, Groups, Loops,
};
use crate::engine::MatchEngine;
use crate::errors::Result;
use crate::flags::Flags;
use crate::graph::{Graph, NodeId, Op};
use crate::parser::ParserState;

pub struct BacktrackEngine<'p, 't> {
    state: &'p ParserState,
    graph: &'p Graph,
    chars: &'t [char],
    /// Outcome cache for lookarounds that neither read nor write groups,
    /// keyed by (node, offset).
    lookaheads: HashMap<(NodeId, usize), bool>,
}

/// Snapshot of one evaluation position.
#[derive(Clone)]
struct State {
    offset: usize,
    groups: Groups,
    loops: Loops,
    checkpoints: CheckPoints,
}

/// What evaluating one node produced.
enum Visit {
    Continue(NodeId, State),
    Fail,
    Matched(State),
}

impl<'p, 't> BacktrackEngine<'p, 't> {
    pub fn new(state: &'p ParserState, graph: &'p Graph, chars: &'t [char]) -> Self {
        BacktrackEngine {
            state,
            graph,
            chars,
            lookaheads: HashMap::new(),
        }
    }

    pub fn run(&mut self, pos: usize, search: bool) -> Result<Option<Groups>> {
        trace!("backtrack run: pos={} search={}", pos, search);
        let mut state = self.fresh_state(pos);
        state.groups.start_group(0, pos);
        match self.run_from(self.graph.entry(), state, search)? {
            Some(mut state) => {
                state.groups.end_group(0, state.offset);
                Ok(Some(state.groups))
            }
            None => Ok(None),
        }
    }

    fn fresh_state(&self, offset: usize) -> State {
        State {
            offset,
            groups: Groups::new(self.state),
            loops: Loops::new(),
            checkpoints: CheckPoints::new(),
        }
    }

    /// The trampoline: evaluate nodes until a match or exhaustion. Used
    /// both for the top-level run and for lookaround sub-evaluations.
    fn run_from(&mut self, entry: NodeId, state: State, search: bool) -> Result<Option<State>> {
        let mut stack: Vec<(NodeId, State)> = vec![];
        let mut node = entry;
        let mut start = state.offset;
        let mut state = state;
        loop {
            match self.visit(&mut stack, node, state)? {
                Visit::Continue(next, s) => {
                    node = next;
                    state = s;
                }
                Visit::Matched(s) => return Ok(Some(s)),
                Visit::Fail => {
                    if let Some((n, s)) = stack.pop() {
                        node = n;
                        state = s;
                        continue;
                    }
                    if search && start < self.chars.len() {
                        start += 1;
                        let mut s = self.fresh_state(start);
                        s.groups.start_group(0, start);
                        state = s;
                        node = entry;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn visit(
        &mut self,
        stack: &mut Vec<(NodeId, State)>,
        node: NodeId,
        mut state: State,
    ) -> Result<Visit> {
        let graph = self.graph;
        let next = graph.next(node);
        let alphabet = self.state.alphabet();
        let ignore_case = self.state.flags().contains(Flags::IGNORECASE);

        match graph.op(node) {
            Op::Str(text) => {
                let mut offset = state.offset;
                for expected in text.chars() {
                    match self.chars.get(offset) {
                        Some(&c) if chars_eq(alphabet, ignore_case, expected, c) => offset += 1,
                        _ => return Ok(Visit::Fail),
                    }
                }
                state.offset = offset;
                Ok(Visit::Continue(next[0], state))
            }
            Op::Character(class) => match self.chars.get(state.offset) {
                Some(&c) if char_in_class(alphabet, ignore_case, class, c) => {
                    state.offset += 1;
                    Ok(Visit::Continue(next[0], state))
                }
                _ => Ok(Visit::Fail),
            },
            Op::Dot { multiline } => match self.chars.get(state.offset) {
                Some(&c) if *multiline || c != '\n' => {
                    state.offset += 1;
                    Ok(Visit::Continue(next[0], state))
                }
                _ => Ok(Visit::Fail),
            },
            Op::Digit { inverted } => match self.chars.get(state.offset) {
                Some(&c) if alphabet.digit(c) != *inverted => {
                    state.offset += 1;
                    Ok(Visit::Continue(next[0], state))
                }
                _ => Ok(Visit::Fail),
            },
            Op::Space { inverted } => match self.chars.get(state.offset) {
                Some(&c) if alphabet.space(c) != *inverted => {
                    state.offset += 1;
                    Ok(Visit::Continue(next[0], state))
                }
                _ => Ok(Visit::Fail),
            },
            Op::Word { inverted } => match self.chars.get(state.offset) {
                Some(&c) if alphabet.word(c) != *inverted => {
                    state.offset += 1;
                    Ok(Visit::Continue(next[0], state))
                }
                _ => Ok(Visit::Fail),
            },
            Op::StartOfLine { multiline } => {
                let previous = state.offset.checked_sub(1).map(|i| self.chars[i]);
                if state.offset == 0 || (*multiline && previous == Some('\n')) {
                    Ok(Visit::Continue(next[0], state))
                } else {
                    Ok(Visit::Fail)
                }
            }
            Op::EndOfLine { multiline } => {
                let current = self.chars.get(state.offset).copied();
                let at_end = state.offset == self.chars.len();
                let before_final_newline =
                    current == Some('\n') && state.offset + 1 == self.chars.len();
                if at_end || (*multiline && current == Some('\n')) || before_final_newline {
                    Ok(Visit::Continue(next[0], state))
                } else {
                    Ok(Visit::Fail)
                }
            }
            Op::EndOfText => {
                if state.offset == self.chars.len() {
                    Ok(Visit::Continue(next[0], state))
                } else {
                    Ok(Visit::Fail)
                }
            }
            Op::WordBoundary { inverted } => {
                let previous = state.offset.checked_sub(1).map(|i| self.chars[i]);
                let current = self.chars.get(state.offset).copied();
                let word = |c: Option<char>| c.map_or(false, |c| alphabet.word(c));
                let boundary = word(current) != word(previous);
                if boundary != *inverted {
                    Ok(Visit::Continue(next[0], state))
                } else {
                    Ok(Visit::Fail)
                }
            }
            Op::StartGroup(number) => {
                state.groups.start_group(*number, state.offset);
                Ok(Visit::Continue(next[0], state))
            }
            Op::EndGroup(number) => {
                state.groups.end_group(*number, state.offset);
                Ok(Visit::Continue(next[0], state))
            }
            Op::GroupReference(number) => {
                let (start, end) = match state.groups.span(*number) {
                    Some(span) => span,
                    None => return Ok(Visit::Fail),
                };
                let mut offset = state.offset;
                for i in start..end {
                    match self.chars.get(offset) {
                        Some(&c) if chars_eq(alphabet, ignore_case, self.chars[i], c) => {
                            offset += 1
                        }
                        _ => return Ok(Visit::Fail),
                    }
                }
                state.offset = offset;
                Ok(Visit::Continue(next[0], state))
            }
            Op::Conditional(number) => {
                let index = if state.groups.defined(*number) { 1 } else { 0 };
                Ok(Visit::Continue(next[index], state))
            }
            Op::Split { .. } => {
                for &alternative in next[1..].iter().rev() {
                    stack.push((alternative, state.clone()));
                }
                Ok(Visit::Continue(next[0], state))
            }
            Op::Match => Ok(Visit::Matched(state)),
            Op::NoMatch => Ok(Visit::Fail),
            Op::CheckPoint => {
                if state.checkpoints.visit(node, state.offset) {
                    Ok(Visit::Continue(next[0], state))
                } else {
                    Ok(Visit::Fail)
                }
            }
            Op::Repeat { begin, end, lazy } => {
                let (begin, end, lazy) = (*begin, *end, *lazy);
                let count = state.loops.increment(node);
                if count < begin {
                    return Ok(Visit::Continue(next[1], state));
                }
                if lazy {
                    // exit now, but leave a fallback that loops once more
                    let can_loop = match end {
                        None => state.offset < self.chars.len(),
                        Some(end) => count < end,
                    };
                    if can_loop {
                        stack.push((next[1], state.clone()));
                    }
                    if end.map_or(true, |end| count <= end) {
                        state.loops.drop(node);
                        Ok(Visit::Continue(next[0], state))
                    } else {
                        Ok(Visit::Fail)
                    }
                } else {
                    // loop again, but leave a fallback that exits
                    if end.map_or(true, |end| count < end) {
                        let mut fallback = state.clone();
                        fallback.loops.drop(node);
                        stack.push((next[0], fallback));
                    }
                    if Some(count) == end {
                        state.loops.drop(node);
                        Ok(Visit::Continue(next[0], state))
                    } else {
                        Ok(Visit::Continue(next[1], state))
                    }
                }
            }
            Op::Lookahead { equal, forwards } => self.lookahead(node, *equal, *forwards, state),
        }
    }

    fn lookahead(
        &mut self,
        node: NodeId,
        equal: bool,
        forwards: bool,
        mut state: State,
    ) -> Result<Visit> {
        let next = self.graph.next(node);
        let (continuation, sub) = (next[0], next[1]);
        let (reads, mutates) = lookahead_logic(self.graph, sub);
        let key = (node, state.offset);
        if !(reads || mutates) {
            if let Some(&ok) = self.lookaheads.get(&key) {
                return Ok(if ok {
                    Visit::Continue(continuation, state)
                } else {
                    Visit::Fail
                });
            }
        }

        // backward sub-patterns carry an implicit leading `.*` and a
        // trailing end anchor, so they run over the truncated input
        let chars: &[char] = if forwards {
            self.chars
        } else {
            &self.chars[..state.offset]
        };
        let mut sub_engine = BacktrackEngine::new(self.state, self.graph, chars);
        let mut sub_state = sub_engine.fresh_state(if forwards { state.offset } else { 0 });
        sub_state.groups = state.groups.clone();
        let outcome = sub_engine.run_from(sub, sub_state, false)?;

        let success = outcome.is_some() == equal;
        if !(reads || mutates) {
            self.lookaheads.insert(key, success);
        }
        if success {
            if mutates {
                if let Some(matched) = outcome {
                    state.groups = matched.groups;
                }
            }
            Ok(Visit::Continue(continuation, state))
        } else {
            Ok(Visit::Fail)
        }
    }
}

impl MatchEngine for BacktrackEngine<'_, '_> {
    const REQUIRE: Flags = Flags::STRINGS;
    const REJECT: Flags = Flags::empty();

    fn run(&mut self, pos: usize, search: bool) -> Result<Option<Groups>> {
        BacktrackEngine::run(self, pos, search)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn run(pattern: &str, text: &str, search: bool) -> Option<(Vec<char>, Groups)> {
        let (state, graph) = parse(pattern, Flags::STRINGS).unwrap();
        let chars: Vec<char> = text.chars().collect();
        let groups = {
            let mut engine = BacktrackEngine::new(&state, &graph, &chars);
            engine.run(0, search).unwrap()
        };
        groups.map(|groups| (chars, groups))
    }

    fn matches(pattern: &str, text: &str) -> Option<(Vec<char>, Groups)> {
        run(pattern, text, false)
    }

    fn searches(pattern: &str, text: &str) -> Option<(Vec<char>, Groups)> {
        run(pattern, text, true)
    }

    fn text_of(chars: &[char], groups: &Groups, number: usize) -> Option<String> {
        groups
            .span(number)
            .map(|(start, end)| chars[start..end].iter().collect())
    }

    #[test]
    fn literal_group_test() {
        let (chars, groups) = matches("a(b)c", "abc").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "abc");
        assert_eq!(text_of(&chars, &groups, 1).unwrap(), "b");
        assert_eq!(groups.span(1), Some((1, 2)));
    }

    #[test]
    fn repeated_group_keeps_last_test() {
        let (chars, groups) = matches("(a|b)+", "abba").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "abba");
        assert_eq!(text_of(&chars, &groups, 1).unwrap(), "a");
        assert_eq!(groups.span(1), Some((3, 4)));
    }

    #[test]
    fn greedy_count_search_test() {
        let (chars, groups) = searches(r"\d{2,4}", "xx12345yy").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "1234");
    }

    #[test]
    fn lazy_count_search_test() {
        let (chars, groups) = searches(r"\d{2,4}?", "xx12345yy").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "12");
    }

    #[test]
    fn named_backreference_test() {
        let (chars, groups) = searches(r"(?P<w>\w+)\s+(?P=w)", "the the end").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "the the");
        let index = groups.index_of("w").unwrap();
        assert_eq!(text_of(&chars, &groups, index).unwrap(), "the");
    }

    #[test]
    fn lookahead_is_zero_width_test() {
        let (chars, groups) = matches("a(?=b)", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "a");
        assert!(matches("a(?=b)", "ac").is_none());
        assert!(matches("a(?!b)", "ac").is_some());
        assert!(matches("a(?!b)", "ab").is_none());
    }

    #[test]
    fn lookbehind_test() {
        let (_, groups) = searches("(?<=a)b", "cab").unwrap();
        assert_eq!(groups.span(0), Some((2, 3)));
        assert!(searches("(?<=a)b", "cbb").is_none());
        let (_, groups) = searches("(?<!a)b", "cbab").unwrap();
        assert_eq!(groups.span(0), Some((1, 2)));
    }

    #[test]
    fn backreference_numeric_test() {
        let (chars, groups) = matches(r"(ab)\1", "abab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "abab");
        assert!(matches(r"(ab)\1", "abac").is_none());
        // an undefined group fails the reference
        assert!(matches(r"(?:(a)|b)\1", "bb").is_none());
        // an empty group matches emptily
        let (_, groups) = matches(r"(a?)x\1y", "xy").unwrap();
        assert_eq!(groups.span(0), Some((0, 2)));
    }

    #[test]
    fn conditional_test() {
        let (chars, groups) = matches("(a)?(?(1)b|c)", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "ab");
        let (chars, groups) = matches("(a)?(?(1)b|c)", "c").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "c");
        assert!(matches("(a)?(?(1)b|c)", "b").is_none());
        // single-branch conditional: the no-path is empty, so the whole
        // pattern can match emptily when the group is absent
        let (_, groups) = matches("(a)?(?(1)b)", "c").unwrap();
        assert_eq!(groups.span(0), Some((0, 0)));
        let (chars, groups) = matches("(a)?(?(1)b)", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "ab");
    }

    #[test]
    fn alternation_priority_test() {
        // earlier alternatives win even when both match
        let (chars, groups) = matches("a|ab", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "a");
    }

    #[test]
    fn greedy_vs_lazy_star_test() {
        let (chars, groups) = matches("<(.*)>", "<a><b>").unwrap();
        assert_eq!(text_of(&chars, &groups, 1).unwrap(), "a><b");
        let (chars, groups) = matches("<(.*?)>", "<a><b>").unwrap();
        assert_eq!(text_of(&chars, &groups, 1).unwrap(), "a");
    }

    #[test]
    fn anchors_test() {
        assert!(matches("^ab$", "ab").is_some());
        assert!(searches("^b", "ab").is_none());
        // $ also matches just before a trailing newline
        assert!(matches("ab$", "ab\n").is_some());
        // \Z does not
        assert!(matches(r"ab\Z", "ab\n").is_none());
        assert!(matches(r"ab\Z", "ab").is_some());
        // multiline ^ and $ work at inner newlines
        assert!(searches("(?m)^b$", "a\nb\nc").is_some());
        assert!(searches("^b$", "a\nb\nc").is_none());
    }

    #[test]
    fn word_boundary_test() {
        let (_, groups) = searches(r"\bfox\b", "the fox.").unwrap();
        assert_eq!(groups.span(0), Some((4, 7)));
        assert!(searches(r"\Box\b", "the fox.").is_some());
        assert!(searches(r"\box\b", "the fox.").is_none());
    }

    #[test]
    fn dotall_test() {
        assert!(matches("a.b", "a\nb").is_none());
        assert!(matches("(?s)a.b", "a\nb").is_some());
    }

    #[test]
    fn ignorecase_test() {
        assert!(matches("(?i)abc", "AbC").is_some());
        assert!(matches("(?i)[a-d]x", "Bx").is_some());
        // backreferences fold too
        assert!(matches(r"(?i)(ab)\1", "abAB").is_some());
        assert!(matches("abc", "AbC").is_none());
    }

    #[test]
    fn empty_alternative_loop_terminates_test() {
        // requires the checkpoint guard to terminate
        let (chars, groups) = matches("(a|)*", "aa").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "aa");
        let (_, groups) = matches("(a|)*", "").unwrap();
        assert_eq!(groups.span(0), Some((0, 0)));
    }

    #[test]
    fn search_is_leftmost_test() {
        let (_, groups) = searches("b+", "abbcbb").unwrap();
        assert_eq!(groups.span(0), Some((1, 3)));
    }

    #[test]
    fn search_empty_match_at_end_test() {
        let (_, groups) = searches("q*", "ab").unwrap();
        assert_eq!(groups.span(0), Some((0, 0)));
        let (_, groups) = searches("$", "ab").unwrap();
        assert_eq!(groups.span(0), Some((2, 2)));
    }

    #[test]
    fn stateful_counted_loop_test() {
        let (chars, groups) = matches("(?:ab){2,3}", "ababab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "ababab");
        assert!(matches("(?:ab){2,3}", "ab").is_none());
        let (chars, groups) = matches("a{3}", "aaaa").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "aaa");
        let _ = chars;
    }

    #[test]
    fn unrolled_counted_loop_test() {
        let (state, graph) = parse("(?_l)a{2,4}", Flags::STRINGS).unwrap();
        let chars: Vec<char> = "aaaaa".chars().collect();
        let mut engine = BacktrackEngine::new(&state, &graph, &chars);
        let groups = engine.run(0, false).unwrap().unwrap();
        assert_eq!(groups.span(0), Some((0, 4)));
    }

    #[test]
    fn lookahead_capture_adoption_test() {
        let (chars, groups) = matches("(?=(b+))b", "bbb").unwrap();
        // the lookahead's capture is visible afterwards
        assert_eq!(text_of(&chars, &groups, 1).unwrap(), "bbb");
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "b");
    }

    #[test]
    fn groupref_in_lookahead_not_cached_test() {
        // the lookahead reads group 1, so its outcome must be computed
        // per surrounding state rather than cached by offset
        let (chars, groups) = matches(r"(a|b)(?=\1)\1", "aa").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "aa");
        assert!(matches(r"(a|b)(?=\1)\1", "ab").is_none());
    }
}
