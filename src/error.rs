use std::error;
use std::fmt;

/// Error taxonomy for the hierarchy core. Variants are grouped by kind
/// rather than by component: a caller matches on the kind to decide whether
/// to abort, warn-and-continue, or retry.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied parameter was out of range or incompatible with
    /// another argument (bad mode, bad variable mask, bad sandglass index,
    /// out-of-range level/id, flux register requested on a non coarse-fine
    /// face).
    Precondition { what: String, value: String },

    /// A structural invariant (proper nesting, father/son or sibling
    /// reciprocity, flux-register allocation) was violated. Fatal in debug
    /// builds; callers running in release builds receive this value but may
    /// choose to continue.
    Invariant { what: String },

    /// A numerical guard tripped (negative density, non-positive pressure)
    /// and the active model has no floor/clamp configured for it.
    NumericalGuard {
        level: u32,
        patch: u64,
        cell: (usize, usize, usize),
        what: String,
    },

    /// The message transport failed to send or receive.
    Transport(String),

    /// The request was well-formed but there is nothing to do (e.g. a
    /// coarse-fine flux exchange requested on a level with no flux
    /// registers). Not fatal; the caller should log and return.
    NonApplicable { what: String },
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Precondition { what, value } => {
                write!(fmt, "precondition violated: {} (got {})", what, value)
            }
            Invariant { what } => write!(fmt, "invariant violated: {}", what),
            NumericalGuard {
                level,
                patch,
                cell,
                what,
            } => write!(
                fmt,
                "numerical guard tripped at level {} patch {} cell {:?}: {}",
                level, patch, cell, what
            ),
            Transport(msg) => write!(fmt, "transport failure: {}", msg),
            NonApplicable { what } => write!(fmt, "non-applicable request: {}", what),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
