use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while compiling or running an expression.
///
/// Engine-internal match failure is not an error (it is ordinary control
/// flow inside the evaluators) and never appears here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The pattern is malformed. The message names the offending construct.
    #[error("cannot parse expression: {0}")]
    Parse(String),

    /// A repeated sub-expression can never consume input, so the repeat
    /// would spin forever. Suppressed by the `_UNSAFE` flag.
    #[error("repeated expression cannot consume input: {0}")]
    Empty(String),

    /// The selected engine does not implement an opcode present in the
    /// graph. Callers may retry with a more capable engine.
    #[error("operation not supported by this engine: {0}")]
    UnsupportedOperation(&'static str),

    /// A group was requested by a number outside the defined range.
    #[error("no group {0}")]
    Index(usize),

    /// A bad value was supplied through the public surface (for example an
    /// unknown flag character).
    #[error("bad value: {0}")]
    Value(String),
}

impl Error {
    pub fn parse(reason: impl Into<String>) -> Error {
        Error::Parse(reason.into())
    }
}
