//! Logging macros.
//!
//! Training code logs through `lmc_trace!` .. `lmc_error!`. Each macro
//! forwards to `defmt` when the `defmt` feature is on, to `tracing` when only
//! `tracing` is on, and otherwise type-checks its arguments and emits
//! nothing. Format strings must stay within the `{}` subset both backends
//! accept.
//!
//! On target, compile-time filtering follows `DEFMT_LOG` (see the workspace
//! `Cargo.toml`): score tables and bitmask dumps sit at `trace`/`debug` and
//! vanish from `info` builds.

/// Swallow a format invocation when no backend is enabled.
#[doc(hidden)]
#[inline(always)]
pub fn discard(_args: core::fmt::Arguments<'_>) {}

macro_rules! lmc_log {
    ($defmt:ident, $tracing:ident, $($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::$defmt!($($arg)*);
        #[cfg(all(feature = "tracing", not(feature = "defmt")))]
        tracing::$tracing!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "tracing")))]
        if false {
            $crate::log::discard(format_args!($($arg)*));
        }
    }};
}

macro_rules! lmc_trace {
    ($($arg:tt)*) => { $crate::log::lmc_log!(trace, trace, $($arg)*) };
}

macro_rules! lmc_debug {
    ($($arg:tt)*) => { $crate::log::lmc_log!(debug, debug, $($arg)*) };
}

macro_rules! lmc_info {
    ($($arg:tt)*) => { $crate::log::lmc_log!(info, info, $($arg)*) };
}

macro_rules! lmc_warn {
    ($($arg:tt)*) => { $crate::log::lmc_log!(warn, warn, $($arg)*) };
}

macro_rules! lmc_error {
    ($($arg:tt)*) => { $crate::log::lmc_log!(error, error, $($arg)*) };
}

pub(crate) use {lmc_debug, lmc_error, lmc_info, lmc_log, lmc_trace, lmc_warn};
