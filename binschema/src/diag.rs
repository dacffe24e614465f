//! Thin diagnostics facade over the `log` crate.
//!
//! The library pairs a `log`-style facade with a concrete subscriber bound
//! by the binary (here, `env_logger` in `binschema-cli`). Routing through
//! this module rather than calling `log::debug!`/`log::warn!` directly keeps
//! the core backend-agnostic and gives one place to add structured fields
//! later if needed.

/// Emits a `debug`-level diagnostic event, e.g. schema load / template
/// instantiation progress.
macro_rules! debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// Emits a `warn`-level diagnostic event, e.g. a schema author mistake this
/// crate tolerates (quoted numeric masks) or a planning fallback.
macro_rules! warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

pub(crate) use debug;
pub(crate) use warn;
