//! The matching engines.
//!
//! Both engines execute the same instruction graph but with opposite
//! trade-offs: the backtracking engine is depth-first with an explicit
//! fallback stack (complete, but exponential on pathological patterns),
//! the parallel engine advances every live alternative in lockstep, one
//! input character per step (linear outer steps, but it refuses
//! multi-character string opcodes).

pub mod backtrack;
pub mod parallel;
pub mod support;

pub use self::backtrack::BacktrackEngine;
pub use self::parallel::ParallelEngine;
pub use self::support::Groups;

use crate::errors::Result;
use crate::flags::Flags;

/// A compiled-pattern evaluator bound to one subject string.
///
/// `REQUIRE` and `REJECT` describe the flag contract: patterns compiled
/// on an engine's behalf get `REQUIRE` added and must not carry `REJECT`
/// bits. Running a graph that violates the contract surfaces
/// `Error::UnsupportedOperation`, which callers may handle by retrying
/// with a more capable engine.
pub trait MatchEngine {
    const REQUIRE: Flags;
    const REJECT: Flags;

    /// Execute the pattern against the subject from `pos`. In search mode
    /// the match may start at any offset at or after `pos`; otherwise it
    /// is anchored at `pos`. Returns the group table of the best match.
    fn run(&mut self, pos: usize, search: bool) -> Result<Option<Groups>>;
}
