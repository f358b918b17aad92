//! Temporary containers used while a pattern is being parsed.
//!
//! The parser assembles `Part`s rather than wiring arena nodes directly;
//! the whole tree is joined into the graph back-to-front once parsing
//! finishes. Leaf nodes are only created (and, for `{n,m}` unrolling,
//! cloned) before any edges exist, which keeps cloning a plain copy.

use crate::errors::{Error, Result};
use crate::flags::Flags;
use crate::graph::{Graph, NodeId, Op};

/// One element of a sequence under construction.
#[derive(Debug)]
pub enum Part {
    /// A literal character (coalesced into runs at join time when the
    /// target engine accepts multi-character strings).
    Str(String),
    /// An already-created arena node, not yet wired.
    Node(NodeId),
    Seq(Sequence),
    Alts(Alternatives),
    Loop(Loop),
    Counted(CountedLoop),
    Look(Look),
    Cond(Cond),
}

impl Part {
    /// Whether every path through this part consumes input; see
    /// `Op::consumes` for `lenient`.
    pub fn consumes(&self, graph: &Graph, lenient: bool) -> bool {
        match self {
            Part::Str(text) => !text.is_empty(),
            Part::Node(id) => graph.op(*id).consumes(lenient),
            Part::Seq(seq) => seq.consumes(graph, lenient),
            Part::Alts(alts) => {
                !alts.branches.is_empty()
                    && alts.branches.iter().all(|b| b.consumes(graph, lenient))
            }
            Part::Loop(l) => l.once && l.body.consumes(graph, lenient),
            Part::Counted(c) => c.begin > 0 && c.body.consumes(graph, lenient),
            Part::Look(_) => false,
            Part::Cond(c) => match &c.no {
                Some(no) => c.yes.consumes(graph, lenient) && no.consumes(graph, lenient),
                None => false,
            },
        }
    }

    /// Whether some path through this part can consume input.
    pub fn may_consume(&self, graph: &Graph) -> bool {
        match self {
            Part::Str(text) => !text.is_empty(),
            Part::Node(id) => graph.op(*id).may_consume(),
            Part::Seq(seq) => seq.may_consume(graph),
            Part::Alts(alts) => alts.branches.iter().any(|b| b.may_consume(graph)),
            Part::Loop(l) => l.body.may_consume(graph),
            Part::Counted(c) => c.end != Some(0) && c.body.may_consume(graph),
            Part::Look(_) => false,
            Part::Cond(c) => {
                c.yes.may_consume(graph)
                    || c.no.as_ref().map_or(false, |no| no.may_consume(graph))
            }
        }
    }

    /// Wire this part into the graph so that it continues at `next`,
    /// returning its entry node.
    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        match self {
            Part::Str(text) => {
                let id = graph.add(Op::Str(text));
                graph.set_next(id, vec![next]);
                id
            }
            Part::Node(id) => {
                graph.set_next(id, vec![next]);
                id
            }
            Part::Seq(seq) => seq.join(graph, flags, next),
            Part::Alts(alts) => alts.join(graph, flags, next),
            Part::Loop(l) => l.join(graph, flags, next),
            Part::Counted(c) => c.join(graph, flags, next),
            Part::Look(l) => l.join(graph, flags, next),
            Part::Cond(c) => c.join(graph, flags, next),
        }
    }

    /// Duplicate this part, copying any arena nodes it owns. Group marker
    /// numbers are preserved: a replicated group keeps its index and the
    /// last iteration wins.
    pub fn clone_with(&self, graph: &mut Graph) -> Part {
        match self {
            Part::Str(text) => Part::Str(text.clone()),
            Part::Node(id) => {
                let op = graph.op(*id).clone();
                Part::Node(graph.add(op))
            }
            Part::Seq(seq) => Part::Seq(seq.clone_with(graph)),
            Part::Alts(alts) => Part::Alts(Alternatives {
                branches: alts.branches.iter().map(|b| b.clone_with(graph)).collect(),
                lazy: alts.lazy,
            }),
            Part::Loop(l) => Part::Loop(Loop {
                body: l.body.clone_with(graph),
                lazy: l.lazy,
                once: l.once,
            }),
            Part::Counted(c) => Part::Counted(CountedLoop {
                body: c.body.clone_with(graph),
                begin: c.begin,
                end: c.end,
                lazy: c.lazy,
            }),
            Part::Look(l) => {
                let op = graph.op(l.node).clone();
                Part::Look(Look {
                    node: graph.add(op),
                    body: l.body.clone_with(graph),
                })
            }
            Part::Cond(c) => {
                let op = graph.op(c.node).clone();
                Part::Cond(Cond {
                    node: graph.add(op),
                    yes: c.yes.clone_with(graph),
                    no: c.no.as_ref().map(|no| no.clone_with(graph)),
                })
            }
        }
    }
}

/// Concatenation of parts.
#[derive(Debug, Default)]
pub struct Sequence {
    parts: Vec<Part>,
}

impl Sequence {
    pub fn new() -> Sequence {
        Sequence::default()
    }

    pub fn from_parts(parts: Vec<Part>) -> Sequence {
        Sequence { parts }
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn pop(&mut self) -> Option<Part> {
        self.parts.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn consumes(&self, graph: &Graph, lenient: bool) -> bool {
        self.parts.iter().any(|p| p.consumes(graph, lenient))
    }

    pub fn may_consume(&self, graph: &Graph) -> bool {
        self.parts.iter().any(|p| p.may_consume(graph))
    }

    pub fn clone_with(&self, graph: &mut Graph) -> Sequence {
        Sequence {
            parts: self.parts.iter().map(|p| p.clone_with(graph)).collect(),
        }
    }

    /// Join the contents back-to-front so that the sequence continues at
    /// `next`. Adjacent literal parts are first coalesced into runs when
    /// `Flags::STRINGS` is set.
    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in self.parts {
            match part {
                Part::Str(text) if flags.contains(Flags::STRINGS) => {
                    if let Some(Part::Str(prev)) = parts.last_mut() {
                        prev.push_str(&text);
                    } else {
                        parts.push(Part::Str(text));
                    }
                }
                other => parts.push(other),
            }
        }
        let mut next = next;
        for part in parts.into_iter().rev() {
            next = part.join(graph, flags, next);
        }
        next
    }
}

/// Ordered alternatives; the first branch has the highest priority.
#[derive(Debug)]
pub struct Alternatives {
    pub branches: Vec<Sequence>,
    lazy: bool,
}

impl Alternatives {
    pub fn new(branches: Vec<Sequence>) -> Alternatives {
        Alternatives {
            branches,
            lazy: false,
        }
    }

    /// `X?`: the body or nothing, with priority decided by laziness.
    pub fn optional(body: Sequence, lazy: bool) -> Alternatives {
        let mut branches = vec![body, Sequence::new()];
        if lazy {
            branches.reverse();
        }
        Alternatives { branches, lazy }
    }

    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        match self.branches.len() {
            0 => {
                let id = graph.add(Op::NoMatch);
                graph.set_next(id, vec![next]);
                id
            }
            1 => {
                let mut branches = self.branches;
                branches.remove(0).join(graph, flags, next)
            }
            _ => {
                let split = graph.add(Op::Split { lazy: self.lazy });
                let entries = self
                    .branches
                    .into_iter()
                    .map(|b| b.join(graph, flags, next))
                    .collect();
                graph.set_next(split, entries);
                split
            }
        }
    }
}

/// `X*` (`once = false`) or `X+` (`once = true`).
#[derive(Debug)]
pub struct Loop {
    body: Sequence,
    lazy: bool,
    once: bool,
}

impl Loop {
    pub fn new(
        graph: &mut Graph,
        flags: Flags,
        mut body: Sequence,
        lazy: bool,
        once: bool,
    ) -> Result<Loop> {
        guard_repeat_body(graph, flags, &mut body)?;
        Ok(Loop { body, lazy, once })
    }

    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        let split = graph.add(Op::Split { lazy: self.lazy });
        let inner = self.body.join(graph, flags, split);
        let edges = if self.lazy {
            vec![next, inner]
        } else {
            vec![inner, next]
        };
        graph.set_next(split, edges);
        if self.once {
            inner
        } else {
            split
        }
    }
}

/// `X{begin,end}` with a runtime counter; `end = None` leaves the range
/// open.
#[derive(Debug)]
pub struct CountedLoop {
    body: Sequence,
    begin: usize,
    end: Option<usize>,
    lazy: bool,
}

impl CountedLoop {
    pub fn new(
        graph: &mut Graph,
        flags: Flags,
        mut body: Sequence,
        begin: usize,
        end: Option<usize>,
        lazy: bool,
    ) -> Result<CountedLoop> {
        if end.is_none() {
            guard_repeat_body(graph, flags, &mut body)?;
        }
        Ok(CountedLoop {
            body,
            begin,
            end,
            lazy,
        })
    }

    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        let count = graph.add(Op::Repeat {
            begin: self.begin,
            end: self.end,
            lazy: self.lazy,
        });
        let inner = self.body.join(graph, flags, count);
        graph.set_next(count, vec![next, inner]);
        count
    }
}

/// A lookaround assertion and its sub-pattern.
#[derive(Debug)]
pub struct Look {
    node: NodeId,
    body: Sequence,
}

impl Look {
    pub fn new(node: NodeId, body: Sequence) -> Look {
        Look { node, body }
    }

    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        let done = graph.add(Op::Match);
        let entry = self.body.join(graph, flags, done);
        graph.set_next(self.node, vec![next, entry]);
        self.node
    }
}

/// `(?(n)yes|no)`; the node selects successor 1 when group `n` is defined.
#[derive(Debug)]
pub struct Cond {
    node: NodeId,
    yes: Sequence,
    no: Option<Sequence>,
}

impl Cond {
    pub fn new(node: NodeId, yes: Sequence, no: Option<Sequence>) -> Cond {
        Cond { node, yes, no }
    }

    pub fn join(self, graph: &mut Graph, flags: Flags, next: NodeId) -> NodeId {
        let yes_entry = self.yes.join(graph, flags, next);
        let no_entry = match self.no {
            Some(no) => no.join(graph, flags, next),
            None => next,
        };
        graph.set_next(self.node, vec![no_entry, yes_entry]);
        self.node
    }
}

/// Enforce termination of a repeat body: a body that can never consume is
/// rejected outright and a body that only sometimes consumes gets a
/// checkpoint guard. `Flags::UNSAFE` suppresses both.
fn guard_repeat_body(graph: &mut Graph, flags: Flags, body: &mut Sequence) -> Result<()> {
    if flags.contains(Flags::UNSAFE) {
        return Ok(());
    }
    if !body.may_consume(graph) {
        return Err(Error::Empty("body never consumes input".to_string()));
    }
    if !body.consumes(graph, false) {
        let checkpoint = graph.add(Op::CheckPoint);
        body.push(Part::Node(checkpoint));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Ascii;

    fn literal(c: char) -> Part {
        Part::Str(c.to_string())
    }

    #[test]
    fn sequence_join_test() {
        let mut graph = Graph::new();
        let mut seq = Sequence::new();
        seq.push(literal('a'));
        seq.push(literal('b'));

        let done = graph.add(Op::Match);
        let entry = seq.join(&mut graph, Flags::empty(), done);
        graph.set_entry(entry);

        assert_eq!(
            graph.assembly(&Ascii),
            "  0: match\n  1: str \"b\" -> 0\n  2: str \"a\" -> 1\n"
        );
        assert_eq!(entry, 2);
    }

    #[test]
    fn sequence_coalesces_strings_test() {
        let mut graph = Graph::new();
        let mut seq = Sequence::new();
        seq.push(literal('a'));
        seq.push(literal('b'));
        seq.push(literal('c'));

        let done = graph.add(Op::Match);
        let entry = seq.join(&mut graph, Flags::STRINGS, done);

        assert!(matches!(graph.op(entry), Op::Str(text) if text.as_str() == "abc"));
    }

    #[test]
    fn greedy_loop_priority_test() {
        let mut graph = Graph::new();
        let mut body = Sequence::new();
        body.push(literal('a'));
        let l = Loop::new(&mut graph, Flags::empty(), body, false, false).unwrap();

        let done = graph.add(Op::Match);
        let split = l.join(&mut graph, Flags::empty(), done);

        // greedy: loop body first, exit second
        let body_entry = graph.next(split)[0];
        assert!(matches!(graph.op(body_entry), Op::Str(_)));
        assert_eq!(graph.next(split)[1], done);
        // the body loops back to the split
        assert_eq!(graph.next(body_entry), &[split]);
    }

    #[test]
    fn lazy_loop_priority_test() {
        let mut graph = Graph::new();
        let mut body = Sequence::new();
        body.push(literal('a'));
        let l = Loop::new(&mut graph, Flags::empty(), body, true, false).unwrap();

        let done = graph.add(Op::Match);
        let split = l.join(&mut graph, Flags::empty(), done);

        // lazy: exit first, loop body second
        assert_eq!(graph.next(split)[0], done);
        assert!(matches!(graph.op(graph.next(split)[1]), Op::Str(_)));
    }

    #[test]
    fn empty_body_gets_checkpoint_test() {
        let mut graph = Graph::new();
        // (a|) may consume but does not always: checkpoint required
        let mut some = Sequence::new();
        some.push(literal('a'));
        let alts = Alternatives::new(vec![some, Sequence::new()]);
        let mut body = Sequence::new();
        body.push(Part::Alts(alts));

        let l = Loop::new(&mut graph, Flags::empty(), body, false, false).unwrap();
        let done = graph.add(Op::Match);
        l.join(&mut graph, Flags::empty(), done);

        let listing = graph.assembly(&Ascii);
        assert!(listing.contains("checkpoint"), "{}", listing);
    }

    #[test]
    fn never_consuming_body_is_error_test() {
        let mut graph = Graph::new();
        let mut body = Sequence::new();
        body.push(Part::Node(graph.add(Op::WordBoundary { inverted: false })));

        assert!(matches!(
            Loop::new(&mut graph, Flags::empty(), body, false, false),
            Err(Error::Empty(_))
        ));
    }

    #[test]
    fn unsafe_flag_suppresses_guard_test() {
        let mut graph = Graph::new();
        let mut body = Sequence::new();
        body.push(Part::Node(graph.add(Op::WordBoundary { inverted: false })));

        assert!(Loop::new(&mut graph, Flags::UNSAFE, body, false, false).is_ok());
    }

    #[test]
    fn counted_loop_join_test() {
        let mut graph = Graph::new();
        let mut body = Sequence::new();
        body.push(literal('x'));
        let c = CountedLoop::new(&mut graph, Flags::empty(), body, 2, Some(4), true).unwrap();

        let done = graph.add(Op::Match);
        let count = c.join(&mut graph, Flags::empty(), done);

        assert!(matches!(
            graph.op(count),
            Op::Repeat {
                begin: 2,
                end: Some(4),
                lazy: true
            }
        ));
        // exit first, body second
        assert_eq!(graph.next(count)[0], done);
        let body_entry = graph.next(count)[1];
        assert_eq!(graph.next(body_entry), &[count]);
    }

    #[test]
    fn alternatives_join_test() {
        let mut graph = Graph::new();
        let mut a = Sequence::new();
        a.push(literal('a'));
        let mut b = Sequence::new();
        b.push(literal('b'));
        let alts = Alternatives::new(vec![a, b]);

        let done = graph.add(Op::Match);
        let split = alts.join(&mut graph, Flags::empty(), done);

        assert!(matches!(graph.op(split), Op::Split { lazy: false }));
        assert_eq!(graph.next(split).len(), 2);
        assert!(matches!(graph.op(graph.next(split)[0]), Op::Str(t) if t.as_str() == "a"));
        assert!(matches!(graph.op(graph.next(split)[1]), Op::Str(t) if t.as_str() == "b"));
    }

    #[test]
    fn clone_with_copies_nodes_test() {
        let mut graph = Graph::new();
        let mut seq = Sequence::new();
        seq.push(Part::Node(graph.add(Op::StartGroup(1))));
        seq.push(literal('a'));
        seq.push(Part::Node(graph.add(Op::EndGroup(1))));

        let before = graph.len();
        let copy = seq.clone_with(&mut graph);
        assert_eq!(graph.len(), before + 2);

        // group numbers survive the copy
        let done = graph.add(Op::Match);
        let entry = copy.join(&mut graph, Flags::empty(), done);
        assert!(matches!(graph.op(entry), Op::StartGroup(1)));
    }
}
