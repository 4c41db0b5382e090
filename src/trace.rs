//! Thin wrappers around the `log` facade.
//!
//! The macros compile to nothing unless the `logging` feature is enabled, so
//! the hot paths stay free of formatting machinery in silent builds.

macro_rules! heap_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        {
            log::trace!(target: "tieralloc", $($arg)*);
        }
    };
}

macro_rules! heap_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "logging")]
        {
            log::debug!(target: "tieralloc", $($arg)*);
        }
    };
}

pub(crate) use heap_debug;
pub(crate) use heap_trace;
