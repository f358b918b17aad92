//! The breadth-first lockstep evaluator.
//!
//! All live alternatives advance together, one input character per outer
//! step, so pathological backtracking cannot occur: a pattern that would
//! make the depth-first engine exponential costs at most one pass over
//! the input times the number of distinct thread states. Zero-width work
//! is done within the current offset; consuming threads move to the next
//! queue, deduplicated by a state fingerprint when enabled.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::mem;

use log::trace;

use crate::engine::support::{
    char_in_class, chars_eq, lookahead_logic, CheckPoints, Groups, Loops,
};
use crate::engine::MatchEngine;
use crate::errors::{Error, Result};
use crate::flags::Flags;
use crate::graph::{Graph, NodeId, Op};
use crate::parser::ParserState;

pub struct ParallelEngine<'p, 't> {
    state: &'p ParserState,
    graph: &'p Graph,
    chars: &'t [char],
    hash_state: bool,
    ticks: usize,
    max_width: usize,
    /// Outcome cache for lookarounds that neither read nor write groups,
    /// keyed by (node, offset).
    lookaheads: HashMap<(NodeId, usize), bool>,
}

/// One live alternative, advanced in lockstep with its siblings.
#[derive(Clone)]
struct Thread {
    node: NodeId,
    groups: Groups,
    loops: Loops,
    checkpoints: CheckPoints,
    /// Literal characters still owed by a backreference; consumed one per
    /// outer step before the node resumes.
    pending: VecDeque<char>,
}

impl Thread {
    fn new(node: NodeId, groups: Groups) -> Thread {
        Thread {
            node,
            groups,
            loops: Loops::new(),
            checkpoints: CheckPoints::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<'p, 't> ParallelEngine<'p, 't> {
    pub fn new(
        state: &'p ParserState,
        graph: &'p Graph,
        chars: &'t [char],
        hash_state: bool,
    ) -> Self {
        ParallelEngine {
            state,
            graph,
            chars,
            hash_state,
            ticks: 0,
            max_width: 0,
            lookaheads: HashMap::new(),
        }
    }

    /// Nodes evaluated, over the whole run.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Largest number of simultaneously live threads seen.
    pub fn max_width(&self) -> usize {
        self.max_width
    }

    pub fn run(&mut self, pos: usize, search: bool) -> Result<Option<Groups>> {
        let mut groups = Groups::new(self.state);
        groups.start_group(0, pos);
        let best = self.run_at(self.graph.entry(), pos, search, groups, true)?;
        trace!(
            "parallel run done: ticks={} width={}",
            self.ticks,
            self.max_width
        );
        Ok(best)
    }

    /// The outer loop: one iteration per input offset. Also used for
    /// lookaround sub-evaluations, which keep the enclosing group 0 open.
    fn run_at(
        &mut self,
        entry: NodeId,
        pos: usize,
        search: bool,
        initial: Groups,
        close_group0: bool,
    ) -> Result<Option<Groups>> {
        let mut offset = pos;
        let mut best: Option<Groups> = None;
        let mut next_queue = vec![Thread::new(entry, initial)];

        while !next_queue.is_empty() {
            let mut current = mem::take(&mut next_queue);
            current.reverse();
            self.max_width = self.max_width.max(current.len());
            let mut seen = HashSet::new();

            while let Some(thread) = current.pop() {
                self.ticks += 1;
                let matched = self.step(
                    thread,
                    offset,
                    close_group0,
                    &mut current,
                    &mut next_queue,
                    &mut seen,
                )?;
                if let Some(groups) = matched {
                    // lower-priority threads at this offset cannot improve
                    // on the match; drop them
                    best = Some(groups);
                    break;
                }
            }

            offset += 1;
            if search && best.is_none() && offset <= self.chars.len() {
                // no commitment yet: try a fresh start one character on,
                // at the lowest priority so earlier starts stay leftmost
                let mut groups = Groups::new(self.state);
                groups.start_group(0, offset);
                next_queue.push(Thread::new(entry, groups));
            }
        }
        Ok(best)
    }

    /// Evaluate one thread at the current offset. Consuming successors go
    /// to the next queue; zero-width successors are pushed back onto the
    /// current queue in reverse priority order (most important last, since
    /// the queue pops from the end).
    fn step(
        &mut self,
        mut thread: Thread,
        offset: usize,
        close_group0: bool,
        current: &mut Vec<Thread>,
        next_queue: &mut Vec<Thread>,
        seen: &mut HashSet<u64>,
    ) -> Result<Option<Groups>> {
        let alphabet = self.state.alphabet();
        let ignore_case = self.state.flags().contains(Flags::IGNORECASE);
        let current_char = self.chars.get(offset).copied();

        if let Some(&expected) = thread.pending.front() {
            if let Some(c) = current_char {
                if chars_eq(alphabet, ignore_case, expected, c) {
                    thread.pending.pop_front();
                    self.enqueue(next_queue, seen, thread);
                }
            }
            return Ok(None);
        }

        let graph = self.graph;
        let node = thread.node;
        let next = graph.next(node);
        match graph.op(node) {
            Op::Str(text) => {
                let mut it = text.chars();
                let expected = match (it.next(), it.next()) {
                    (Some(c), None) => c,
                    _ => return Err(Error::UnsupportedOperation("multi-character string")),
                };
                if let Some(c) = current_char {
                    if chars_eq(alphabet, ignore_case, expected, c) {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::Character(class) => {
                if let Some(c) = current_char {
                    if char_in_class(alphabet, ignore_case, class, c) {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::Dot { multiline } => {
                if let Some(c) = current_char {
                    if *multiline || c != '\n' {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::Digit { inverted } => {
                if let Some(c) = current_char {
                    if alphabet.digit(c) != *inverted {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::Space { inverted } => {
                if let Some(c) = current_char {
                    if alphabet.space(c) != *inverted {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::Word { inverted } => {
                if let Some(c) = current_char {
                    if alphabet.word(c) != *inverted {
                        thread.node = next[0];
                        self.enqueue(next_queue, seen, thread);
                    }
                }
                Ok(None)
            }
            Op::StartOfLine { multiline } => {
                let previous = offset.checked_sub(1).map(|i| self.chars[i]);
                if offset == 0 || (*multiline && previous == Some('\n')) {
                    thread.node = next[0];
                    current.push(thread);
                }
                Ok(None)
            }
            Op::EndOfLine { multiline } => {
                let at_end = offset == self.chars.len();
                let before_final_newline =
                    current_char == Some('\n') && offset + 1 == self.chars.len();
                if at_end || (*multiline && current_char == Some('\n')) || before_final_newline {
                    thread.node = next[0];
                    current.push(thread);
                }
                Ok(None)
            }
            Op::EndOfText => {
                if offset == self.chars.len() {
                    thread.node = next[0];
                    current.push(thread);
                }
                Ok(None)
            }
            Op::WordBoundary { inverted } => {
                let previous = offset.checked_sub(1).map(|i| self.chars[i]);
                let word = |c: Option<char>| c.map_or(false, |c| alphabet.word(c));
                let boundary = word(current_char) != word(previous);
                if boundary != *inverted {
                    thread.node = next[0];
                    current.push(thread);
                }
                Ok(None)
            }
            Op::StartGroup(number) => {
                thread.groups.start_group(*number, offset);
                thread.node = next[0];
                current.push(thread);
                Ok(None)
            }
            Op::EndGroup(number) => {
                thread.groups.end_group(*number, offset);
                thread.node = next[0];
                current.push(thread);
                Ok(None)
            }
            Op::GroupReference(number) => {
                match thread.groups.span(*number) {
                    None => {}
                    Some((start, end)) if start == end => {
                        thread.node = next[0];
                        current.push(thread);
                    }
                    Some((start, end)) => {
                        // replay the captured text as a pending literal,
                        // keeping the lockstep discipline intact
                        thread.pending = self.chars[start..end].iter().copied().collect();
                        thread.node = next[0];
                        current.push(thread);
                    }
                }
                Ok(None)
            }
            Op::Conditional(number) => {
                let index = if thread.groups.defined(*number) { 1 } else { 0 };
                thread.node = next[index];
                current.push(thread);
                Ok(None)
            }
            Op::Split { .. } => {
                for &alternative in next[1..].iter().rev() {
                    let mut fork = thread.clone();
                    fork.node = alternative;
                    current.push(fork);
                }
                thread.node = next[0];
                current.push(thread);
                Ok(None)
            }
            Op::Repeat { begin, end, lazy } => {
                let (begin, end, lazy) = (*begin, *end, *lazy);
                let count = thread.loops.increment(node);
                if count < begin {
                    thread.node = next[1];
                    current.push(thread);
                    return Ok(None);
                }
                if lazy {
                    let can_loop = end.map_or(current_char.is_some(), |end| count < end);
                    if can_loop {
                        let mut again = thread.clone();
                        again.node = next[1];
                        current.push(again);
                    }
                    if end.map_or(true, |end| count <= end) {
                        thread.loops.drop(node);
                        thread.node = next[0];
                        current.push(thread);
                    }
                } else {
                    if end.map_or(true, |end| count < end) {
                        let mut exit = thread.clone();
                        exit.loops.drop(node);
                        exit.node = next[0];
                        current.push(exit);
                    }
                    if Some(count) == end {
                        thread.loops.drop(node);
                        thread.node = next[0];
                        current.push(thread);
                    } else {
                        thread.node = next[1];
                        current.push(thread);
                    }
                }
                Ok(None)
            }
            Op::CheckPoint => {
                if thread.checkpoints.visit(node, offset) {
                    thread.node = next[0];
                    current.push(thread);
                }
                Ok(None)
            }
            Op::Lookahead { equal, forwards } => {
                let (equal, forwards) = (*equal, *forwards);
                let (continuation, sub) = (next[0], next[1]);
                let (reads, mutates) = lookahead_logic(graph, sub);
                let key = (node, offset);

                let cached = if !(reads || mutates) {
                    self.lookaheads.get(&key).copied()
                } else {
                    None
                };
                let (success, adopted) = match cached {
                    Some(ok) => (ok, None),
                    None => {
                        let chars: &[char] = if forwards {
                            self.chars
                        } else {
                            &self.chars[..offset]
                        };
                        let start = if forwards { offset } else { 0 };
                        let mut sub_engine =
                            ParallelEngine::new(self.state, self.graph, chars, self.hash_state);
                        let outcome =
                            sub_engine.run_at(sub, start, false, thread.groups.clone(), false)?;
                        self.ticks += sub_engine.ticks;
                        let success = outcome.is_some() == equal;
                        if !(reads || mutates) {
                            self.lookaheads.insert(key, success);
                        }
                        (success, if mutates { outcome } else { None })
                    }
                };
                if success {
                    if let Some(groups) = adopted {
                        thread.groups = groups;
                    }
                    thread.node = continuation;
                    current.push(thread);
                }
                Ok(None)
            }
            Op::Match => {
                if close_group0 {
                    thread.groups.end_group(0, offset);
                }
                Ok(Some(thread.groups))
            }
            Op::NoMatch => Ok(None),
        }
    }

    fn enqueue(&self, next_queue: &mut Vec<Thread>, seen: &mut HashSet<u64>, thread: Thread) {
        if self.hash_state {
            let mut hasher = DefaultHasher::new();
            thread.node.hash(&mut hasher);
            thread.pending.hash(&mut hasher);
            thread.groups.hash_into(&mut hasher);
            thread.loops.hash_into(&mut hasher);
            thread.checkpoints.hash_into(&mut hasher);
            if !seen.insert(hasher.finish()) {
                return;
            }
        }
        next_queue.push(thread);
    }
}

impl MatchEngine for ParallelEngine<'_, '_> {
    const REQUIRE: Flags = Flags::empty();
    const REJECT: Flags = Flags::STRINGS;

    fn run(&mut self, pos: usize, search: bool) -> Result<Option<Groups>> {
        ParallelEngine::run(self, pos, search)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backtrack::BacktrackEngine;
    use crate::parser::parse;

    fn run(pattern: &str, text: &str, search: bool) -> Option<(Vec<char>, Groups)> {
        let (state, graph) = parse(pattern, Flags::empty()).unwrap();
        let chars: Vec<char> = text.chars().collect();
        let groups = {
            let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
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
        assert_eq!(groups.span(1), Some((1, 2)));
    }

    #[test]
    fn greedy_priority_test() {
        let (chars, groups) = matches("(a|b)+", "abba").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "abba");
        assert_eq!(groups.span(1), Some((3, 4)));
    }

    #[test]
    fn leftmost_first_alternation_test() {
        let (chars, groups) = matches("a|ab", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "a");
    }

    #[test]
    fn counted_repeats_test() {
        let (chars, groups) = searches(r"\d{2,4}", "xx12345yy").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "1234");
        let (chars, groups) = searches(r"\d{2,4}?", "xx12345yy").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "12");
    }

    #[test]
    fn backreference_pending_test() {
        let (chars, groups) = searches(r"(?P<w>\w+)\s+(?P=w)", "the the end").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "the the");
        assert!(matches(r"(ab)\1", "abab").is_some());
        assert!(matches(r"(ab)\1", "abac").is_none());
    }

    #[test]
    fn lookarounds_test() {
        let (chars, groups) = matches("a(?=b)", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "a");
        assert!(matches("a(?=b)", "ac").is_none());
        let (_, groups) = searches("(?<=a)b", "cab").unwrap();
        assert_eq!(groups.span(0), Some((2, 3)));
        assert!(matches("a(?!b)", "ac").is_some());
    }

    #[test]
    fn conditional_test() {
        let (chars, groups) = matches("(a)?(?(1)b|c)", "ab").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "ab");
        let (chars, groups) = matches("(a)?(?(1)b|c)", "c").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "c");
    }

    #[test]
    fn empty_loop_terminates_test() {
        let (chars, groups) = matches("(a|)*", "aa").unwrap();
        assert_eq!(text_of(&chars, &groups, 0).unwrap(), "aa");
    }

    #[test]
    fn multichar_string_is_unsupported_test() {
        // compiled for the backtracking engine, run on the wrong one
        let (state, graph) = parse("abc", Flags::STRINGS).unwrap();
        let chars: Vec<char> = "abc".chars().collect();
        let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
        assert!(matches!(
            engine.run(0, false),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn pathological_pattern_is_linear_test() {
        // the classic exponential-backtracking case: the lockstep engine
        // finishes with a bounded thread width and one pass per character
        let subject: String = "x".repeat(30);
        let (state, graph) = parse("(x+x+)+y", Flags::empty()).unwrap();
        let chars: Vec<char> = subject.chars().collect();
        let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
        assert!(engine.run(0, false).unwrap().is_none());
        // polynomial in the input (distinct capture spans widen the state
        // space), nowhere near the depth-first engine's 2^30
        let n = chars.len() + 2;
        assert!(engine.max_width() <= graph.len() * n * n);
        assert!(engine.ticks() <= graph.len() * n * n * n);

        let with_y = format!("{}y", subject);
        let chars: Vec<char> = with_y.chars().collect();
        let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
        let groups = engine.run(0, false).unwrap().unwrap();
        assert_eq!(groups.span(0), Some((0, chars.len())));
    }

    #[test]
    fn width_diagnostics_test() {
        let (state, graph) = parse("a|b|c", Flags::empty()).unwrap();
        let chars: Vec<char> = "c".chars().collect();
        let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
        engine.run(0, false).unwrap().unwrap();
        assert!(engine.max_width() >= 1);
        assert!(engine.ticks() > 0);
    }

    /// Both engines must agree wherever the pattern is within the
    /// parallel engine's subset.
    #[test]
    fn engines_agree_test() {
        let cases: &[(&str, &str)] = &[
            ("a(b)c", "abc"),
            ("(a|b)+", "abba"),
            (r"\d{2,4}", "xx12345yy"),
            (r"\d{2,4}?", "xx12345yy"),
            ("a|ab", "ab"),
            ("<(.*)>", "<a><b>"),
            ("<(.*?)>", "<a><b>"),
            ("(a|)*", "aaa"),
            (r"(?P<w>\w+)\s+(?P=w)", "the the end"),
            ("(?<=a)b", "cab"),
            ("a(?=b)", "ab"),
            ("(a)?(?(1)b|c)", "ab"),
            ("(a)?(?(1)b|c)", "c"),
            (r"\bfox\b", "the fox."),
            ("(?m)^b$", "a\nb\nc"),
            ("x*", "ab"),
            ("q", "ab"),
        ];
        for &(pattern, text) in cases {
            for &search in &[false, true] {
                let chars: Vec<char> = text.chars().collect();

                let (state, graph) = parse(pattern, BacktrackEngine::REQUIRE).unwrap();
                let back = {
                    let mut engine = BacktrackEngine::new(&state, &graph, &chars);
                    engine.run(0, search).unwrap()
                };

                let (state, graph) = parse(pattern, ParallelEngine::REQUIRE).unwrap();
                let par = {
                    let mut engine = ParallelEngine::new(&state, &graph, &chars, true);
                    engine.run(0, search).unwrap()
                };

                match (back, par) {
                    (None, None) => {}
                    (Some(b), Some(p)) => {
                        assert_eq!(
                            b.span(0),
                            p.span(0),
                            "span(0) differs for {:?} on {:?} (search={})",
                            pattern,
                            text,
                            search
                        );
                        for i in 1..=b.count() {
                            assert_eq!(
                                b.span(i),
                                p.span(i),
                                "span({}) differs for {:?} on {:?} (search={})",
                                i,
                                pattern,
                                text,
                                search
                            );
                        }
                    }
                    (b, p) => panic!(
                        "engines disagree for {:?} on {:?} (search={}): {:?} vs {:?}",
                        pattern,
                        text,
                        search,
                        b.map(|g| g.span(0)),
                        p.map(|g| g.span(0))
                    ),
                }
            }
        }
    }
}
