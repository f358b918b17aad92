pub mod builder;

use std::fmt::Write;

use crate::alphabet::Alphabet;
use crate::charset::Character;

/// Index of a node in the graph arena.
///
/// Nodes are identity-compared through their id; cycles (loops, lookaround
/// back-edges) are plain index references.
pub type NodeId = usize;

/// One instruction of a compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Match a literal run of characters. Multi-character runs only appear
    /// when the pattern was compiled with `Flags::STRINGS`.
    Str(String),
    /// Match one character against a class.
    Character(Character),
    /// Match any character (except `\n` unless `multiline`).
    Dot { multiline: bool },
    /// `^` / `\A`: zero-width, start of input or after a newline.
    StartOfLine { multiline: bool },
    /// `$`: zero-width, end of input, before a trailing newline, or before
    /// any newline when `multiline`.
    EndOfLine { multiline: bool },
    /// `\Z`: zero-width, absolute end of input.
    EndOfText,
    /// `\b` / `\B`.
    WordBoundary { inverted: bool },
    /// `\d` / `\D`.
    Digit { inverted: bool },
    /// `\s` / `\S`.
    Space { inverted: bool },
    /// `\w` / `\W`.
    Word { inverted: bool },
    /// Record the start of a capture group.
    StartGroup(usize),
    /// Record the end of a capture group.
    EndGroup(usize),
    /// Match the text previously captured by a group.
    GroupReference(usize),
    /// Two-way branch on whether a group is defined: successor 1 when it
    /// is, successor 0 otherwise.
    Conditional(usize),
    /// Ordered alternatives; earlier successors have higher priority. The
    /// `lazy` flag only records how the continuation edge was placed.
    Split { lazy: bool },
    /// Successful end of the pattern.
    Match,
    /// Dead end; matches nothing.
    NoMatch,
    /// Zero-width sub-pattern assertion. Successor 0 is the continuation,
    /// successor 1 the sub-pattern entry.
    Lookahead { equal: bool, forwards: bool },
    /// Counted repeat with a runtime counter. Successor 0 is the exit,
    /// successor 1 the loop body.
    Repeat {
        begin: usize,
        end: Option<usize>,
        lazy: bool,
    },
    /// Guard inserted into repeat bodies that may consume nothing: fails
    /// when re-visited at an unchanged offset.
    CheckPoint,
}

impl Op {
    /// Whether every path through this single node consumes input. With
    /// `lenient`, nodes whose consumption is unknowable at parse time
    /// (group references) count as consuming.
    pub fn consumes(&self, lenient: bool) -> bool {
        match self {
            Op::Str(text) => !text.is_empty(),
            Op::Character(_) | Op::Dot { .. } => true,
            Op::Digit { .. } | Op::Space { .. } | Op::Word { .. } => true,
            Op::GroupReference(_) => lenient,
            _ => false,
        }
    }

    /// Whether some path through this node can consume input.
    pub fn may_consume(&self) -> bool {
        self.consumes(true)
    }

    fn describe(&self, alphabet: &dyn Alphabet) -> String {
        match self {
            Op::Str(text) => format!("str {:?}", text),
            Op::Character(ch) => format!("char {}", ch.to_str(alphabet)),
            Op::Dot { multiline } => format!("dot{}", if *multiline { " multiline" } else { "" }),
            Op::StartOfLine { multiline } => {
                format!("start-of-line{}", if *multiline { " multiline" } else { "" })
            }
            Op::EndOfLine { multiline } => {
                format!("end-of-line{}", if *multiline { " multiline" } else { "" })
            }
            Op::EndOfText => "end-of-text".to_string(),
            Op::WordBoundary { inverted } => {
                format!("word-boundary{}", if *inverted { " inverted" } else { "" })
            }
            Op::Digit { inverted } => format!("digit{}", if *inverted { " inverted" } else { "" }),
            Op::Space { inverted } => format!("space{}", if *inverted { " inverted" } else { "" }),
            Op::Word { inverted } => format!("word{}", if *inverted { " inverted" } else { "" }),
            Op::StartGroup(n) => format!("start-group {}", n),
            Op::EndGroup(n) => format!("end-group {}", n),
            Op::GroupReference(n) => format!("group-ref {}", n),
            Op::Conditional(n) => format!("conditional {}", n),
            Op::Split { lazy } => format!("split{}", if *lazy { "?" } else { "" }),
            Op::Match => "match".to_string(),
            Op::NoMatch => "no-match".to_string(),
            Op::Lookahead { equal, forwards } => format!(
                "look{}{}",
                if *forwards { "ahead" } else { "behind" },
                if *equal { "" } else { " negative" }
            ),
            Op::Repeat { begin, end, lazy } => {
                let mut out = format!("repeat {}", begin);
                match end {
                    Some(end) => {
                        let _ = write!(out, ", {}", end);
                    }
                    None => out.push_str(", ..."),
                }
                if *lazy {
                    out.push('?');
                }
                out
            }
            Op::CheckPoint => "checkpoint".to_string(),
        }
    }
}

/// A node and its ordered successors. Successor 0 has the highest
/// priority wherever several exist.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub next: Vec<NodeId>,
}

/// The compiled instruction graph. Immutable once assembly finishes; all
/// runtime state lives in the engines.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    entry: NodeId,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add(&mut self, op: Op) -> NodeId {
        self.nodes.push(Node { op, next: vec![] });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn set_entry(&mut self, entry: NodeId) {
        self.entry = entry;
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id].op
    }

    pub fn next(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].next
    }

    pub fn set_next(&mut self, id: NodeId, next: Vec<NodeId>) {
        self.nodes[id].next = next;
    }

    /// All instructions, in arena order.
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.nodes.iter().map(|node| &node.op)
    }

    /// One numbered line per node, in the style of a VM listing. Used by
    /// the parser tests to pin down graph shapes.
    pub fn assembly(&self, alphabet: &dyn Alphabet) -> String {
        let mut out = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let _ = write!(&mut out, "{:3}: {}", i, node.op.describe(alphabet));
            if !node.next.is_empty() {
                let next = node
                    .next
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(&mut out, " -> {}", next);
            }
            out.push('\n');
        }
        out
    }
}
