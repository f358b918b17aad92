//! Regular expressions with interchangeable matching engines.
//!
//! A pattern is parsed by a character-driven state machine into an
//! immutable instruction graph (an arena of opcode nodes), which either
//! of two engines can execute: a depth-first backtracking evaluator with
//! an explicit fallback stack, or a breadth-first evaluator that advances
//! every live alternative in lockstep and therefore cannot backtrack
//! catastrophically.
//!
//! ```
//! use regexp::RegExp;
//!
//! let re = RegExp::new(r"(?P<word>\w+)\s+(?P=word)").unwrap();
//! let m = re.find("hear hear!").unwrap().unwrap();
//! assert_eq!(m.group(0).unwrap(), Some("hear hear"));
//! assert_eq!(m.group_name("word").unwrap(), Some("hear"));
//! ```

pub mod alphabet;
pub mod charset;
pub mod engine;
pub mod errors;
pub mod flags;
pub mod graph;
pub mod instance;
pub mod parser;

pub use crate::engine::{BacktrackEngine, Groups, MatchEngine, ParallelEngine};
pub use crate::errors::{Error, Result};
pub use crate::flags::Flags;
pub use crate::instance::{escape, EngineKind, Matches, Pattern, RegExp, RegExpMatch};
pub use crate::parser::{parse, ParserState};
