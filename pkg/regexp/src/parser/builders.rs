//! The character-driven state machine that turns a pattern string into an
//! instruction graph.
//!
//! Each builder consumes one character at a time; child builders are
//! pushed onto an explicit stack and deliver their result back to the
//! builder below when they finish. Feeding `None` signals end of input.
//! The only thing resembling recursion is the stack itself, so deeply
//! nested patterns cannot exhaust the host stack.

use std::mem;

use crate::alphabet::{Alphabet, Unpacked};
use crate::charset::{Character, CharacterSimplified, ClassKind};
use crate::errors::{Error, Result};
use crate::flags::Flags;
use crate::graph::builder::{Alternatives, Cond, CountedLoop, Look, Loop, Part, Sequence};
use crate::graph::{Graph, Op};
use crate::parser::ParserState;

/// Run the machine over a whole pattern and assemble the graph.
pub(super) fn run(text: &str, state: &mut ParserState) -> Result<Graph> {
    let mut graph = Graph::new();
    let mut stack = vec![Builder::Sequence(SequenceBuilder::new(Role::Top))];
    for c in text.chars() {
        feed(&mut stack, state, &mut graph, Some(c))?;
    }
    feed(&mut stack, state, &mut graph, None)?;

    let root = match stack.pop() {
        Some(Builder::Sequence(seq)) if stack.is_empty() && matches!(seq.role, Role::Top) => seq,
        _ => return Err(Error::parse("incomplete expression")),
    };
    let part = root.into_part();
    let done = graph.add(Op::Match);
    let entry = part.join(&mut graph, state.flags(), done);
    graph.set_entry(entry);
    Ok(graph)
}

/// What a builder decided to do with one character.
enum Outcome {
    /// Stay on the stack.
    Keep(Builder),
    /// Stay, with a new child on top.
    KeepPush(Builder, Builder),
    /// Replace this builder with another.
    Become(Builder),
    /// Replace this builder and re-handle the current character.
    BecomeReplay(Builder),
    /// Finish with nothing to deliver.
    Pop,
    /// Finish and feed the given (possibly transformed) characters to the
    /// parent, in order.
    PopFeed(Vec<(Option<char>, bool)>),
    /// Finish and deliver a part to the enclosing sequence.
    PopPart(Part),
    /// Same, then re-handle the current character.
    PopPartReplay(Part),
    /// Finish and deliver a predicate class to the enclosing charset.
    PopClass(ClassKind, bool),
    /// Finish a `{...}` count; the enclosing sequence wraps its last part
    /// and re-handles the current character.
    PopCountReplay {
        begin: usize,
        end: Option<usize>,
        lazy: bool,
    },
    /// Finish one conditional branch, terminated by the given character.
    PopBranch(Part, char),
}

fn feed(
    stack: &mut Vec<Builder>,
    state: &mut ParserState,
    graph: &mut Graph,
    ch: Option<char>,
) -> Result<()> {
    let mut pending = vec![(ch, false)];
    while let Some((ch, escaped)) = pending.pop() {
        let builder = stack
            .pop()
            .ok_or_else(|| Error::parse("incomplete expression"))?;
        match builder.handle(state, graph, ch, escaped)? {
            Outcome::Keep(b) => stack.push(b),
            Outcome::KeepPush(b, child) => {
                stack.push(b);
                stack.push(child);
            }
            Outcome::Become(b) => stack.push(b),
            Outcome::BecomeReplay(b) => {
                stack.push(b);
                pending.push((ch, escaped));
            }
            Outcome::Pop => {}
            Outcome::PopFeed(events) => {
                for event in events.into_iter().rev() {
                    pending.push(event);
                }
            }
            Outcome::PopPart(part) => deliver_part(stack, part)?,
            Outcome::PopPartReplay(part) => {
                deliver_part(stack, part)?;
                pending.push((ch, escaped));
            }
            Outcome::PopClass(kind, inverted) => {
                deliver_class(stack, state, kind, inverted)?;
            }
            Outcome::PopCountReplay { begin, end, lazy } => {
                deliver_count(stack, state, graph, begin, end, lazy)?;
                pending.push((ch, escaped));
            }
            Outcome::PopBranch(part, terminal) => {
                deliver_branch(stack, state, graph, part, terminal)?;
            }
        }
    }
    Ok(())
}

fn deliver_part(stack: &mut Vec<Builder>, part: Part) -> Result<()> {
    match stack.last_mut() {
        Some(Builder::Sequence(seq)) => {
            seq.nodes.push(part);
            Ok(())
        }
        _ => Err(Error::parse("unexpected expression fragment")),
    }
}

fn deliver_class(
    stack: &mut Vec<Builder>,
    state: &ParserState,
    kind: ClassKind,
    inverted: bool,
) -> Result<()> {
    match stack.last_mut() {
        Some(Builder::CharSet(set)) => set.receive_class(kind, inverted, state.alphabet()),
        _ => Err(Error::parse("class escape outside character set")),
    }
}

fn deliver_count(
    stack: &mut Vec<Builder>,
    state: &ParserState,
    graph: &mut Graph,
    begin: usize,
    end: Option<usize>,
    lazy: bool,
) -> Result<()> {
    let seq = match stack.last_mut() {
        Some(Builder::Sequence(seq)) => seq,
        _ => return Err(Error::parse("unexpected repeat count")),
    };
    let latest = seq
        .nodes
        .pop()
        .ok_or_else(|| Error::parse("nothing to repeat"))?;
    let flags = state.flags();
    if flags.contains(Flags::LOOP_UNROLL) {
        for _ in 0..begin {
            let copy = latest.clone_with(graph);
            seq.nodes.push(copy);
        }
        match end {
            Some(end) => {
                for _ in begin..end {
                    let copy = latest.clone_with(graph);
                    let body = Sequence::from_parts(vec![copy]);
                    seq.nodes.push(Part::Alts(Alternatives::optional(body, lazy)));
                }
            }
            None => {
                let copy = latest.clone_with(graph);
                let body = Sequence::from_parts(vec![copy]);
                let star = Loop::new(graph, flags, body, lazy, false)?;
                seq.nodes.push(Part::Loop(star));
            }
        }
    } else {
        let body = Sequence::from_parts(vec![latest]);
        let counted = CountedLoop::new(graph, flags, body, begin, end, lazy)?;
        seq.nodes.push(Part::Counted(counted));
    }
    Ok(())
}

fn deliver_branch(
    stack: &mut Vec<Builder>,
    state: &ParserState,
    graph: &mut Graph,
    part: Part,
    terminal: char,
) -> Result<()> {
    let conditional = match stack.pop() {
        Some(Builder::Conditional(c)) => c,
        _ => return Err(Error::parse("unexpected conditional branch")),
    };
    match conditional.receive_branch(state, graph, part, terminal)? {
        BranchStep::More(conditional) => {
            stack.push(Builder::Conditional(conditional));
            stack.push(Builder::Sequence(SequenceBuilder::new(Role::YesNo {
                terminals: ")",
            })));
            Ok(())
        }
        BranchStep::Done(part) => deliver_part(stack, part),
    }
}

enum Builder {
    Sequence(SequenceBuilder),
    Repeat(RepeatBuilder),
    Count(CountBuilder),
    GroupEscape(GroupEscapeBuilder),
    FlagGroup(FlagGroupBuilder),
    Named(NamedGroupBuilder),
    Comment(CommentBuilder),
    Lookback(LookbackBuilder),
    Conditional(ConditionalBuilder),
    CharSet(CharSetBuilder),
    Escape(EscapeBuilder),
    Code(CodeEscapeBuilder),
    Octal(OctalEscapeBuilder),
    GroupRef(GroupRefBuilder),
}

impl Builder {
    fn handle(
        self,
        state: &mut ParserState,
        graph: &mut Graph,
        ch: Option<char>,
        escaped: bool,
    ) -> Result<Outcome> {
        match self {
            Builder::Sequence(b) => b.handle(state, graph, ch, escaped),
            Builder::Repeat(b) => b.handle(state, graph, ch),
            Builder::Count(b) => b.handle(ch),
            Builder::GroupEscape(b) => b.handle(state, ch),
            Builder::FlagGroup(b) => b.handle(state, ch),
            Builder::Named(b) => b.handle(state, graph, ch, escaped),
            Builder::Comment(b) => b.handle(ch, escaped),
            Builder::Lookback(b) => b.handle(ch),
            Builder::Conditional(b) => b.handle(ch, escaped),
            Builder::CharSet(b) => b.handle(state, graph, ch, escaped),
            Builder::Escape(b) => b.handle(graph, ch),
            Builder::Code(b) => b.handle(state, ch),
            Builder::Octal(b) => b.handle(state, ch, escaped),
            Builder::GroupRef(b) => b.handle(state, graph, ch, escaped),
        }
    }
}

/// What a sequence is being collected for.
#[derive(Clone, Copy)]
enum Role {
    Top,
    Group { mark: Option<usize> },
    Look { equal: bool, forwards: bool },
    YesNo { terminals: &'static str },
}

/// Collects parts and alternatives; the work-horse of the machine.
struct SequenceBuilder {
    role: Role,
    alternatives: Vec<Sequence>,
    nodes: Sequence,
    comment: bool,
}

impl SequenceBuilder {
    fn new(role: Role) -> SequenceBuilder {
        SequenceBuilder {
            role,
            alternatives: vec![],
            nodes: Sequence::new(),
            comment: false,
        }
    }

    fn handle(
        mut self,
        state: &mut ParserState,
        graph: &mut Graph,
        ch: Option<char>,
        escaped: bool,
    ) -> Result<Outcome> {
        // verbose-mode comments swallow everything to end of line
        if self.comment && !escaped {
            match ch {
                Some('\n') => {
                    self.comment = false;
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                Some(_) => return Ok(Outcome::Keep(Builder::Sequence(self))),
                None => self.comment = false,
            }
        }

        let c = match ch {
            Some(c) => c,
            None => {
                return match self.role {
                    Role::Top => Ok(Outcome::Keep(Builder::Sequence(self))),
                    Role::Group { .. } => Err(Error::parse("unterminated group")),
                    Role::Look { .. } => Err(Error::parse("unterminated lookaround")),
                    Role::YesNo { .. } => Err(Error::parse("incomplete conditional match")),
                }
            }
        };

        if !escaped {
            if let Role::YesNo { terminals } = self.role {
                if terminals.contains(c) {
                    return Ok(Outcome::PopBranch(self.into_part(), c));
                }
            }
            match c {
                ')' => return self.close(state, graph),
                ']' | '}' => return Err(Error::parse(format!("unexpected {}", c))),
                '\\' => {
                    return Ok(Outcome::KeepPush(
                        Builder::Sequence(self),
                        Builder::Escape(EscapeBuilder::new(EscapeKind::Complex)),
                    ))
                }
                '{' => {
                    return Ok(Outcome::KeepPush(
                        Builder::Sequence(self),
                        Builder::Count(CountBuilder::new()),
                    ))
                }
                '(' => {
                    return Ok(Outcome::KeepPush(
                        Builder::Sequence(self),
                        Builder::GroupEscape(GroupEscapeBuilder::new()),
                    ))
                }
                '[' => {
                    return Ok(Outcome::KeepPush(
                        Builder::Sequence(self),
                        Builder::CharSet(CharSetBuilder::new()),
                    ))
                }
                '.' => {
                    let id = graph.add(Op::Dot {
                        multiline: state.flags().contains(Flags::DOTALL),
                    });
                    self.nodes.push(Part::Node(id));
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                '^' => {
                    let id = graph.add(Op::StartOfLine {
                        multiline: state.flags().contains(Flags::MULTILINE),
                    });
                    self.nodes.push(Part::Node(id));
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                '$' => {
                    let id = graph.add(Op::EndOfLine {
                        multiline: state.flags().contains(Flags::MULTILINE),
                    });
                    self.nodes.push(Part::Node(id));
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                '|' => {
                    let nodes = mem::take(&mut self.nodes);
                    self.alternatives.push(nodes);
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                '+' | '?' | '*' => {
                    let latest = self
                        .nodes
                        .pop()
                        .ok_or_else(|| Error::parse("nothing to repeat"))?;
                    return Ok(Outcome::KeepPush(
                        Builder::Sequence(self),
                        Builder::Repeat(RepeatBuilder { latest, kind: c }),
                    ));
                }
                _ => {}
            }
            if state.flags().contains(Flags::VERBOSE) {
                if c.is_whitespace() {
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
                if c == '#' {
                    self.comment = true;
                    return Ok(Outcome::Keep(Builder::Sequence(self)));
                }
            }
        }

        self.push_literal(state, graph, c)?;
        Ok(Outcome::Keep(Builder::Sequence(self)))
    }

    fn push_literal(&mut self, state: &ParserState, graph: &mut Graph, c: char) -> Result<()> {
        match state.alphabet().unpack(c, state.flags())? {
            Unpacked::Single(c) => self.nodes.push(Part::Str(c.to_string())),
            Unpacked::Set(set) => {
                let id = graph.add(Op::Character(Character::with_set(set)));
                self.nodes.push(Part::Node(id));
            }
        }
        Ok(())
    }

    /// An unescaped `)`: close a group-like role.
    fn close(self, state: &mut ParserState, graph: &mut Graph) -> Result<Outcome> {
        match self.role {
            Role::Top | Role::YesNo { .. } => Err(Error::parse("unexpected )")),
            Role::Group { mark } => {
                let contents = self.into_part();
                let part = match mark {
                    Some(number) => {
                        let start = graph.add(Op::StartGroup(number));
                        let end = graph.add(Op::EndGroup(number));
                        Part::Seq(Sequence::from_parts(vec![
                            Part::Node(start),
                            contents,
                            Part::Node(end),
                        ]))
                    }
                    None => contents,
                };
                Ok(Outcome::PopPart(part))
            }
            Role::Look { equal, forwards } => {
                let contents = self.into_part();
                let node = graph.add(Op::Lookahead { equal, forwards });
                let mut parts = vec![];
                if !forwards {
                    // a lookbehind matches the sub-pattern ending exactly at
                    // the current position: scan forward over anything, then
                    // anchor at the cut point
                    let mut dot = Sequence::new();
                    dot.push(Part::Node(graph.add(Op::Dot { multiline: true })));
                    let star = Loop::new(graph, state.flags(), dot, false, false)?;
                    parts.push(Part::Loop(star));
                }
                parts.push(contents);
                if !forwards {
                    parts.push(Part::Node(graph.add(Op::EndOfText)));
                }
                let body = Sequence::from_parts(parts);
                Ok(Outcome::PopPart(Part::Look(Look::new(node, body))))
            }
        }
    }

    /// Turn the collected alternatives into a single part.
    fn into_part(mut self) -> Part {
        let nodes = mem::take(&mut self.nodes);
        self.alternatives.push(nodes);
        if self.alternatives.len() == 1 {
            Part::Seq(self.alternatives.remove(0))
        } else {
            Part::Alts(Alternatives::new(self.alternatives))
        }
    }
}

/// Wraps the previous atom after `+`, `?` or `*`, waiting one character to
/// see whether the repeat is lazy.
struct RepeatBuilder {
    latest: Part,
    kind: char,
}

impl RepeatBuilder {
    fn handle(self, state: &mut ParserState, graph: &mut Graph, ch: Option<char>) -> Result<Outcome> {
        let lazy = ch == Some('?');
        let flags = state.flags();
        let body = Sequence::from_parts(vec![self.latest]);
        let part = match self.kind {
            '?' => Part::Alts(Alternatives::optional(body, lazy)),
            '+' => Part::Loop(Loop::new(graph, flags, body, lazy, true)?),
            '*' => Part::Loop(Loop::new(graph, flags, body, lazy, false)?),
            other => return Err(Error::parse(format!("bad repeat character: {}", other))),
        };
        if lazy {
            Ok(Outcome::PopPart(part))
        } else {
            Ok(Outcome::PopPartReplay(part))
        }
    }
}

/// Parses `{n}`, `{n,}` and `{n,m}`, with an optional trailing `?`.
struct CountBuilder {
    begin: Option<usize>,
    end: Option<usize>,
    acc: String,
    range: bool,
    closed: bool,
    lazy: bool,
}

impl CountBuilder {
    fn new() -> CountBuilder {
        CountBuilder {
            begin: None,
            end: None,
            acc: String::new(),
            range: false,
            closed: false,
            lazy: false,
        }
    }

    fn handle(mut self, ch: Option<char>) -> Result<Outcome> {
        if self.closed {
            if !self.lazy && ch == Some('?') {
                self.lazy = true;
                return Ok(Outcome::Keep(Builder::Count(self)));
            }
            let begin = self
                .begin
                .ok_or_else(|| Error::parse("missing lower limit for repeat"))?;
            let end = if self.range { self.end } else { Some(begin) };
            return Ok(Outcome::PopCountReplay {
                begin,
                end,
                lazy: self.lazy,
            });
        }
        match ch {
            Some('}') => {
                self.store_value()?;
                self.closed = true;
                Ok(Outcome::Keep(Builder::Count(self)))
            }
            Some(',') => {
                self.store_value()?;
                Ok(Outcome::Keep(Builder::Count(self)))
            }
            Some(c) => {
                self.acc.push(c);
                Ok(Outcome::Keep(Builder::Count(self)))
            }
            None => Err(Error::parse("incomplete count specification")),
        }
    }

    fn store_value(&mut self) -> Result<()> {
        if self.begin.is_none() {
            if self.acc.is_empty() {
                return Err(Error::parse("missing lower limit for repeat"));
            }
            self.begin = Some(
                self.acc
                    .parse()
                    .map_err(|_| Error::parse(format!("bad lower limit for repeat: {}", self.acc)))?,
            );
        } else {
            if self.range {
                return Err(Error::parse("too many values in repeat"));
            }
            self.range = true;
            if !self.acc.is_empty() {
                let end: usize = self
                    .acc
                    .parse()
                    .map_err(|_| Error::parse(format!("bad upper limit for repeat: {}", self.acc)))?;
                if self.begin > Some(end) {
                    return Err(Error::parse("inconsistent repeat range"));
                }
                self.end = Some(end);
            }
        }
        self.acc.clear();
        Ok(())
    }
}

/// Dispatches on the character after `(`, and after `(?`.
struct GroupEscapeBuilder {
    seen_question: bool,
}

impl GroupEscapeBuilder {
    fn new() -> GroupEscapeBuilder {
        GroupEscapeBuilder {
            seen_question: false,
        }
    }

    fn handle(mut self, state: &mut ParserState, ch: Option<char>) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("unterminated group")),
        };
        if !self.seen_question {
            if c == '?' {
                self.seen_question = true;
                return Ok(Outcome::Keep(Builder::GroupEscape(self)));
            }
            let mark = state.next_group(None)?;
            return Ok(Outcome::BecomeReplay(Builder::Sequence(
                SequenceBuilder::new(Role::Group { mark: Some(mark) }),
            )));
        }
        match c {
            ':' => Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                Role::Group { mark: None },
            )))),
            'P' => Ok(Outcome::Become(Builder::Named(NamedGroupBuilder::new()))),
            '#' => Ok(Outcome::Become(Builder::Comment(CommentBuilder))),
            '=' => Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                Role::Look {
                    equal: true,
                    forwards: true,
                },
            )))),
            '!' => Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                Role::Look {
                    equal: false,
                    forwards: true,
                },
            )))),
            '<' => Ok(Outcome::Become(Builder::Lookback(LookbackBuilder))),
            '(' => Ok(Outcome::Become(Builder::Conditional(
                ConditionalBuilder::new(),
            ))),
            c if c == '_' || Flags::from_letter(c).is_some() => Ok(Outcome::BecomeReplay(
                Builder::FlagGroup(FlagGroupBuilder::new()),
            )),
            c => Err(Error::parse(format!("unexpected qualifier after (? - {}", c))),
        }
    }
}

/// Inline flags `(?imsuxa)` and the internal `(?_l)`, `(?_s)`, `(?_u)`.
struct FlagGroupBuilder {
    escape: bool,
}

impl FlagGroupBuilder {
    fn new() -> FlagGroupBuilder {
        FlagGroupBuilder { escape: false }
    }

    fn handle(mut self, state: &mut ParserState, ch: Option<char>) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("unterminated flag group")),
        };
        if self.escape {
            let flag = match c {
                'l' => Flags::LOOP_UNROLL,
                's' => Flags::STRINGS,
                'u' => Flags::UNSAFE,
                c => return Err(Error::parse(format!("unexpected flag: _{}", c))),
            };
            state.new_flag(flag);
            self.escape = false;
            return Ok(Outcome::Keep(Builder::FlagGroup(self)));
        }
        if c == '_' {
            self.escape = true;
            return Ok(Outcome::Keep(Builder::FlagGroup(self)));
        }
        if let Some(flag) = Flags::from_letter(c) {
            state.new_flag(flag);
            return Ok(Outcome::Keep(Builder::FlagGroup(self)));
        }
        if c == ')' {
            return Ok(Outcome::Pop);
        }
        Err(Error::parse(format!("unexpected flag character: {}", c)))
    }
}

/// `(?P<name>pattern)` and `(?P=name)`.
struct NamedGroupBuilder {
    create: Option<bool>,
    name: String,
}

impl NamedGroupBuilder {
    fn new() -> NamedGroupBuilder {
        NamedGroupBuilder {
            create: None,
            name: String::new(),
        }
    }

    fn handle(
        mut self,
        state: &mut ParserState,
        graph: &mut Graph,
        ch: Option<char>,
        escaped: bool,
    ) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("incomplete named group")),
        };
        match self.create {
            None => match c {
                '<' => {
                    self.create = Some(true);
                    Ok(Outcome::Keep(Builder::Named(self)))
                }
                '=' => {
                    self.create = Some(false);
                    Ok(Outcome::Keep(Builder::Named(self)))
                }
                c => Err(Error::parse(format!(
                    "unexpected qualifier after (?P - {}",
                    c
                ))),
            },
            Some(true) if !escaped && c == '>' => {
                if self.name.is_empty() {
                    return Err(Error::parse("empty group name"));
                }
                let mark = state.next_group(Some(&self.name))?;
                Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                    Role::Group { mark: Some(mark) },
                ))))
            }
            Some(false) if !escaped && c == ')' => {
                let number = state.index_for_name(&self.name)?;
                let id = graph.add(Op::GroupReference(number));
                Ok(Outcome::PopPart(Part::Node(id)))
            }
            Some(_) if !escaped && c == '\\' => Ok(Outcome::KeepPush(
                Builder::Named(self),
                Builder::Escape(EscapeBuilder::new(EscapeKind::Simple)),
            )),
            Some(_) => {
                self.name.push(c);
                Ok(Outcome::Keep(Builder::Named(self)))
            }
        }
    }
}

/// `(?#...)`: discarded entirely.
struct CommentBuilder;

impl CommentBuilder {
    fn handle(self, ch: Option<char>, escaped: bool) -> Result<Outcome> {
        match ch {
            None => Err(Error::parse("incomplete comment")),
            Some(')') if !escaped => Ok(Outcome::Pop),
            Some('\\') if !escaped => Ok(Outcome::KeepPush(
                Builder::Comment(self),
                Builder::Escape(EscapeBuilder::new(EscapeKind::Simple)),
            )),
            Some(_) => Ok(Outcome::Keep(Builder::Comment(self))),
        }
    }
}

/// The character after `(?<`: lookbehind, positive or negative.
struct LookbackBuilder;

impl LookbackBuilder {
    fn handle(self, ch: Option<char>) -> Result<Outcome> {
        match ch {
            Some('=') => Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                Role::Look {
                    equal: true,
                    forwards: false,
                },
            )))),
            Some('!') => Ok(Outcome::Become(Builder::Sequence(SequenceBuilder::new(
                Role::Look {
                    equal: false,
                    forwards: false,
                },
            )))),
            Some(c) => Err(Error::parse(format!(
                "unexpected qualifier after (?< - {}",
                c
            ))),
            None => Err(Error::parse("unterminated lookaround")),
        }
    }
}

enum BranchStep {
    More(ConditionalBuilder),
    Done(Part),
}

/// `(?(id/name)yes-pattern|optional-no-pattern)`.
struct ConditionalBuilder {
    name: String,
    yes: Option<Part>,
}

impl ConditionalBuilder {
    fn new() -> ConditionalBuilder {
        ConditionalBuilder {
            name: String::new(),
            yes: None,
        }
    }

    fn handle(mut self, ch: Option<char>, escaped: bool) -> Result<Outcome> {
        match ch {
            None => Err(Error::parse("incomplete conditional match")),
            Some(')') if !escaped => Ok(Outcome::KeepPush(
                Builder::Conditional(self),
                Builder::Sequence(SequenceBuilder::new(Role::YesNo { terminals: "|)" })),
            )),
            Some('\\') if !escaped => Ok(Outcome::KeepPush(
                Builder::Conditional(self),
                Builder::Escape(EscapeBuilder::new(EscapeKind::Simple)),
            )),
            Some(c) => {
                self.name.push(c);
                Ok(Outcome::Keep(Builder::Conditional(self)))
            }
        }
    }

    fn receive_branch(
        mut self,
        state: &ParserState,
        graph: &mut Graph,
        part: Part,
        terminal: char,
    ) -> Result<BranchStep> {
        if self.yes.is_none() {
            self.yes = Some(part);
            if terminal == '|' {
                return Ok(BranchStep::More(self));
            }
            return Ok(BranchStep::Done(self.finish(state, graph, None)?));
        }
        Ok(BranchStep::Done(self.finish(state, graph, Some(part))?))
    }

    fn finish(self, state: &ParserState, graph: &mut Graph, no: Option<Part>) -> Result<Part> {
        let number = state.index_for_name_or_number(&self.name)?;
        let node = graph.add(Op::Conditional(number));
        let yes = match self.yes {
            Some(part) => Sequence::from_parts(vec![part]),
            None => return Err(Error::parse("incomplete conditional match")),
        };
        let no = no.map(|part| Sequence::from_parts(vec![part]));
        Ok(Part::Cond(Cond::new(node, yes, no)))
    }
}

/// `[...]`: builds a character class, handling ranges, a leading `^`, a
/// bare `]` or `-` as the first member, and class escapes.
struct CharSetBuilder {
    character: Character,
    invert: Option<bool>,
    queue: Option<char>,
    range: bool,
}

impl CharSetBuilder {
    fn new() -> CharSetBuilder {
        CharSetBuilder {
            character: Character::new(),
            invert: None,
            queue: None,
            range: false,
        }
    }

    fn handle(
        mut self,
        state: &mut ParserState,
        graph: &mut Graph,
        ch: Option<char>,
        escaped: bool,
    ) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("unterminated character set")),
        };
        let alphabet = state.alphabet();

        if self.invert.is_none() && !escaped && c == '^' {
            self.invert = Some(true);
            return Ok(Outcome::Keep(Builder::CharSet(self)));
        }
        if !escaped && c == '\\' {
            return Ok(Outcome::KeepPush(
                Builder::CharSet(self),
                Builder::Escape(EscapeBuilder::new(EscapeKind::InClass)),
            ));
        }

        let empty_so_far = self.character.is_empty() && self.queue.is_none();
        if empty_so_far || escaped || (c != '-' && c != ']') {
            self.append_char(c, alphabet)?;
        } else if c == '-' {
            if self.range {
                // a repeated '-' is a range ending in '-'
                self.append_char(c, alphabet)?;
            } else {
                self.range = true;
            }
        } else {
            // c == ']'
            if let Some(q) = self.queue.take() {
                if self.range {
                    return Err(Error::parse("open range"));
                }
                self.character.append_interval((q, q), alphabet)?;
            } else if self.range {
                return Err(Error::parse("open range"));
            }
            if self.invert == Some(true) {
                self.character.invert();
            }
            let part = match self.character.simplify(alphabet)? {
                CharacterSimplified::NoMatch => Part::Node(graph.add(Op::NoMatch)),
                CharacterSimplified::Any => Part::Node(graph.add(Op::Dot { multiline: true })),
                CharacterSimplified::Single(c) => Part::Str(c.to_string()),
                CharacterSimplified::Character(character) => {
                    Part::Node(graph.add(Op::Character(character)))
                }
            };
            return Ok(Outcome::PopPart(part));
        }

        // after the first member an unescaped '^' is a plain character
        if self.invert.is_none() {
            self.invert = Some(false);
        }
        Ok(Outcome::Keep(Builder::CharSet(self)))
    }

    fn append_char(&mut self, c: char, alphabet: &dyn Alphabet) -> Result<()> {
        if self.range {
            match self.queue.take() {
                None => return Err(Error::parse("incomplete range")),
                Some(q) => {
                    self.character.append_interval((q, c), alphabet)?;
                    self.range = false;
                }
            }
        } else {
            if let Some(q) = self.queue {
                self.character.append_interval((q, q), alphabet)?;
            }
            self.queue = Some(c);
        }
        Ok(())
    }

    fn receive_class(
        &mut self,
        kind: ClassKind,
        inverted: bool,
        alphabet: &dyn Alphabet,
    ) -> Result<()> {
        if self.range {
            return Err(Error::parse("cannot use a class as a range endpoint"));
        }
        if let Some(q) = self.queue.take() {
            self.character.append_interval((q, q), alphabet)?;
        }
        self.character.append_class(kind, inverted);
        if self.invert.is_none() {
            self.invert = Some(false);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum EscapeKind {
    /// Escaped characters only (names, comments, conditional ids).
    Simple,
    /// Inside `[...]`: adds the predicate class escapes.
    InClass,
    /// Pattern level: adds anchors, word boundaries, predicate classes and
    /// backreferences.
    Complex,
}

/// The character after `\`.
struct EscapeBuilder {
    kind: EscapeKind,
}

impl EscapeBuilder {
    fn new(kind: EscapeKind) -> EscapeBuilder {
        EscapeBuilder { kind }
    }

    fn handle(self, graph: &mut Graph, ch: Option<char>) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("incomplete character escape")),
        };

        if c == 'x' || c == 'u' || c == 'U' {
            let length = match c {
                'x' => 2,
                'u' => 4,
                _ => 8,
            };
            return Ok(Outcome::Become(Builder::Code(CodeEscapeBuilder {
                buffer: String::new(),
                remaining: length,
            })));
        }

        match self.kind {
            EscapeKind::Complex => {
                if c.is_ascii_digit() && c != '0' {
                    return Ok(Outcome::Become(Builder::GroupRef(GroupRefBuilder {
                        buffer: c.to_string(),
                    })));
                }
                let part = match c {
                    'A' => Some(Op::StartOfLine { multiline: false }),
                    'Z' => Some(Op::EndOfText),
                    'b' => Some(Op::WordBoundary { inverted: false }),
                    'B' => Some(Op::WordBoundary { inverted: true }),
                    'd' => Some(Op::Digit { inverted: false }),
                    'D' => Some(Op::Digit { inverted: true }),
                    's' => Some(Op::Space { inverted: false }),
                    'S' => Some(Op::Space { inverted: true }),
                    'w' => Some(Op::Word { inverted: false }),
                    'W' => Some(Op::Word { inverted: true }),
                    _ => None,
                };
                if let Some(op) = part {
                    return Ok(Outcome::PopPart(Part::Node(graph.add(op))));
                }
            }
            EscapeKind::InClass => {
                let class = match c {
                    'd' => Some((ClassKind::Digit, false)),
                    'D' => Some((ClassKind::Digit, true)),
                    's' => Some((ClassKind::Space, false)),
                    'S' => Some((ClassKind::Space, true)),
                    'w' => Some((ClassKind::Word, false)),
                    'W' => Some((ClassKind::Word, true)),
                    _ => None,
                };
                if let Some((kind, inverted)) = class {
                    return Ok(Outcome::PopClass(kind, inverted));
                }
            }
            EscapeKind::Simple => {}
        }

        if c.is_ascii_digit() {
            return Ok(Outcome::Become(Builder::Octal(OctalEscapeBuilder {
                buffer: c.to_string(),
            })));
        }
        if let Some(decoded) = self.std_escape(c) {
            return Ok(Outcome::PopFeed(vec![(Some(decoded), true)]));
        }
        if !c.is_ascii_alphabetic() {
            return Ok(Outcome::PopFeed(vec![(Some(c), true)]));
        }
        Err(Error::parse(format!("unexpected escape: \\{}", c)))
    }

    fn std_escape(&self, c: char) -> Option<char> {
        Some(match c {
            'a' => '\u{7}',
            'f' => '\u{c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\u{b}',
            // a word boundary at pattern level, a backspace elsewhere
            'b' if !matches!(self.kind, EscapeKind::Complex) => '\u{8}',
            _ => return None,
        })
    }
}

/// `\xHH`, `\uHHHH`, `\UHHHHHHHH`.
struct CodeEscapeBuilder {
    buffer: String,
    remaining: usize,
}

impl CodeEscapeBuilder {
    fn handle(mut self, state: &ParserState, ch: Option<char>) -> Result<Outcome> {
        let c = match ch {
            Some(c) => c,
            None => return Err(Error::parse("incomplete unicode escape")),
        };
        self.buffer.push(c);
        self.remaining -= 1;
        if self.remaining > 0 {
            return Ok(Outcome::Keep(Builder::Code(self)));
        }
        let code = u32::from_str_radix(&self.buffer, 16)
            .map_err(|_| Error::parse(format!("bad unicode escape: {}", self.buffer)))?;
        let decoded = state.alphabet().unescape(code)?;
        Ok(Outcome::PopFeed(vec![(Some(decoded), true)]))
    }
}

/// Up to three octal digits.
struct OctalEscapeBuilder {
    buffer: String,
}

impl OctalEscapeBuilder {
    fn handle(mut self, state: &ParserState, ch: Option<char>, escaped: bool) -> Result<Outcome> {
        if let Some(c) = ch {
            if ('0'..='7').contains(&c) {
                self.buffer.push(c);
                if self.buffer.len() == 3 {
                    let decoded = self.decode(state)?;
                    return Ok(Outcome::PopFeed(vec![(Some(decoded), true)]));
                }
                return Ok(Outcome::Keep(Builder::Octal(self)));
            }
        }
        let decoded = self.decode(state)?;
        Ok(Outcome::PopFeed(vec![(Some(decoded), true), (ch, escaped)]))
    }

    fn decode(&self, state: &ParserState) -> Result<char> {
        let code = u32::from_str_radix(&self.buffer, 8)
            .map_err(|_| Error::parse(format!("bad octal escape: {}", self.buffer)))?;
        state.alphabet().unescape(code)
    }
}

/// `\1`..`\99`, falling back to an octal escape when three octal digits
/// are seen.
struct GroupRefBuilder {
    buffer: String,
}

impl GroupRefBuilder {
    fn handle(
        mut self,
        state: &ParserState,
        graph: &mut Graph,
        ch: Option<char>,
        escaped: bool,
    ) -> Result<Outcome> {
        if let Some(c) = ch {
            if c.is_ascii_digit() && !escaped {
                self.buffer.push(c);
                if self.buffer.len() == 3 && self.buffer.chars().all(|c| ('0'..='7').contains(&c)) {
                    let code = u32::from_str_radix(&self.buffer, 8)
                        .map_err(|_| Error::parse(format!("bad octal escape: {}", self.buffer)))?;
                    let decoded = state.alphabet().unescape(code)?;
                    return Ok(Outcome::PopFeed(vec![(Some(decoded), true)]));
                }
                return Ok(Outcome::Keep(Builder::GroupRef(self)));
            }
        }
        let number: usize = self
            .buffer
            .parse()
            .map_err(|_| Error::parse(format!("bad group reference: {}", self.buffer)))?;
        let id = graph.add(Op::GroupReference(number));
        Ok(Outcome::PopPartReplay(Part::Node(id)))
    }
}
