//! The built-in logger implementation.
//!
//! The collector logs through the `log` crate facade.  When the default Cargo
//! feature "builtin_env_logger" is enabled, an `env_logger` is installed the
//! first time a collector is constructed, showing logs of level INFO or lower
//! and configurable through the usual environment variables.  An embedder
//! that integrates with its own logging framework can disable the feature and
//! register its own `log` implementation instead.

/// Attempt to init an env_logger for the collector.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("Initialized the built-in env_logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` can only mean that a logger was already installed.
                    debug!("Did not initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
