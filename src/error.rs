use std::io;

use stackswap::stack::StackError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable failures surfaced while creating a fiber.
///
/// Contract violations (switching on a thread that was never adopted, handing
/// over a released or foreign context) are not errors; the checked API aborts
/// the process on them.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("unable to install the guard page fault handler: {0}")]
    SignalHandler(io::Error),
    #[error("unable to set up the alternate signal stack: {0}")]
    SignalStack(io::Error),
    #[error("profiled stack at {0:#x} lies outside the addresses the profiler can index")]
    Unindexed(usize),
}

/// Reports a broken runtime contract and aborts the process.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        eprintln!("fiberglass: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}

pub(crate) use fatal;
