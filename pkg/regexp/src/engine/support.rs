//! Per-run state shared by the engines: capture groups, loop counters and
//! empty-loop checkpoints.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::alphabet::Alphabet;
use crate::charset::Character;
use crate::graph::{Graph, NodeId, Op};
use crate::parser::ParserState;

/// Capture group spans for one execution state.
///
/// Spans are kept sparse: a group that never closed is simply absent.
/// Name tables are shared (`Rc`) so that cloning on a thread fork costs
/// only the defined spans.
#[derive(Debug, Clone)]
pub struct Groups {
    count: usize,
    names: Rc<HashMap<String, usize>>,
    indices: Rc<HashMap<usize, String>>,
    spans: HashMap<usize, (usize, usize)>,
    starts: HashMap<usize, usize>,
    last_index: Option<usize>,
}

impl Groups {
    pub fn new(state: &ParserState) -> Groups {
        Groups {
            count: state.group_count(),
            names: state.group_names(),
            indices: state.group_indices(),
            spans: HashMap::new(),
            starts: HashMap::new(),
            last_index: None,
        }
    }

    /// Number of capturing groups in the pattern, excluding group 0.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn start_group(&mut self, number: usize, offset: usize) {
        self.starts.insert(number, offset);
    }

    /// Close a group. Without a matching open this is a no-op, which lets
    /// sub-evaluations run a shared `Match` node without touching the
    /// overall span.
    pub fn end_group(&mut self, number: usize, offset: usize) {
        if let Some(start) = self.starts.remove(&number) {
            self.spans.insert(number, (start, offset));
            if number != 0 {
                self.last_index = Some(number);
            }
        }
    }

    pub fn defined(&self, number: usize) -> bool {
        self.spans.contains_key(&number)
    }

    /// The span of a group, or `None` when it did not participate in the
    /// match. Offsets are character offsets into the subject.
    pub fn span(&self, number: usize) -> Option<(usize, usize)> {
        self.spans.get(&number).copied()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, number: usize) -> Option<&str> {
        self.indices.get(&number).map(|s| s.as_str())
    }

    /// Index of the last closed capturing group, if any.
    pub fn last_index(&self) -> Option<usize> {
        self.last_index
    }

    /// Name of the last closed capturing group, if it has one.
    pub fn last_group(&self) -> Option<&str> {
        self.last_index.and_then(|i| self.name_of(i))
    }

    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        let mut spans: Vec<_> = self.spans.iter().collect();
        spans.sort();
        spans.hash(hasher);
        let mut starts: Vec<_> = self.starts.iter().collect();
        starts.sort();
        starts.hash(hasher);
        self.last_index.hash(hasher);
    }
}

/// Counters for stateful repeats. Because loops are statically nested,
/// the counters form a stack keyed by the repeat node: re-entering an
/// outer loop discards the counters of everything nested below it.
#[derive(Debug, Clone, Default)]
pub struct Loops {
    counts: Vec<(NodeId, usize)>,
}

impl Loops {
    pub fn new() -> Loops {
        Loops::default()
    }

    /// Bump the counter for a repeat node, returning the new count. The
    /// first visit counts as zero.
    pub fn increment(&mut self, node: NodeId) -> usize {
        match self.counts.iter().position(|(n, _)| *n == node) {
            Some(depth) => {
                self.counts.truncate(depth + 1);
                self.counts[depth].1 += 1;
                self.counts[depth].1
            }
            None => {
                self.counts.push((node, 0));
                0
            }
        }
    }

    /// Remove the counter for a node and everything nested inside it.
    pub fn drop(&mut self, node: NodeId) {
        if let Some(depth) = self.counts.iter().position(|(n, _)| *n == node) {
            self.counts.truncate(depth);
        }
    }

    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        self.counts.hash(hasher);
    }
}

/// Guard state for empty-loop checkpoints: a checkpoint fails when it is
/// revisited without the offset having moved.
#[derive(Debug, Clone, Default)]
pub struct CheckPoints {
    seen: HashMap<NodeId, usize>,
}

impl CheckPoints {
    pub fn new() -> CheckPoints {
        CheckPoints::default()
    }

    /// Record a visit; returns false when the loop made no progress.
    pub fn visit(&mut self, node: NodeId, offset: usize) -> bool {
        if self.seen.get(&node) == Some(&offset) {
            return false;
        }
        self.seen.insert(node, offset);
        true
    }

    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        let mut seen: Vec<_> = self.seen.iter().collect();
        seen.sort();
        seen.hash(hasher);
    }
}

/// Character equality under the current flags.
pub fn chars_eq(alphabet: &dyn Alphabet, ignore_case: bool, a: char, b: char) -> bool {
    if a == b {
        return true;
    }
    ignore_case && alphabet.case_pair(a).0 == alphabet.case_pair(b).0
}

/// Class membership under the current flags: with `IGNORECASE` a
/// character matches when any of its case equivalents lies in the class.
pub fn char_in_class(
    alphabet: &dyn Alphabet,
    ignore_case: bool,
    class: &Character,
    c: char,
) -> bool {
    if class.contains(c, alphabet) {
        return true;
    }
    if !ignore_case {
        return false;
    }
    let (lo, hi) = alphabet.case_pair(c);
    (lo != c && class.contains(lo, alphabet)) || (hi != c && class.contains(hi, alphabet))
}

/// Whether the sub-pattern of a lookaround reads or writes capture
/// groups. Results gate the per-offset outcome cache: a sub-pattern that
/// touches groups cannot be cached, and one that writes them updates the
/// enclosing state on success.
pub fn lookahead_logic(graph: &Graph, entry: NodeId) -> (bool, bool) {
    let mut reads = false;
    let mut mutates = false;
    let mut stack = vec![entry];
    let mut visited = vec![false; graph.len()];
    while let Some(node) = stack.pop() {
        if visited[node] {
            continue;
        }
        visited[node] = true;
        match graph.op(node) {
            Op::GroupReference(_) | Op::Conditional(_) => reads = true,
            Op::StartGroup(_) => mutates = true,
            _ => {}
        }
        stack.extend(graph.next(node).iter().copied());
    }
    (reads, mutates)
}
