//! Logging for the discovery, connector and gateway runtimes.
//!
//! Reactor threads log under the `treelink::discovery` and
//! `treelink::connector` targets; gateway routing logs under
//! `treelink::gateway`, always on the owner thread. Build with
//! `--features tracing` to get any output. Without it every macro below
//! swallows its arguments, so variables that only feed a log line are named
//! with a leading underscore.

/// Default filter: everything this crate emits.
#[cfg(feature = "tracing")]
const DEFAULT_DIRECTIVES: &str = "treelink=trace";

/// Installs a `tracing` subscriber with uptime timestamps and thread names,
/// filtered by `RUST_LOG` or, if unset, by `treelink=trace`.
///
/// Safe to call more than once; only the first call installs anything.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVES);
}

/// Like [`init_tracing`], with `default_directives` used when `RUST_LOG` is
/// unset, e.g. `"treelink=info"` for a command-line tool.
#[cfg(feature = "tracing")]
pub fn init_tracing_with(default_directives: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    // `treelink-discovery` and `treelink-connector` threads show up by name.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing_with(_default_directives: &str) {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_repeatable() {
        super::init_tracing();
        super::init_tracing_with("treelink=info");
        super::info!(runtime = "test", "logging still works after a second init");
    }
}
