use log::SetLoggerError;

/// Attempt to init a env_logger with `info` as the default level.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub fn try_init() -> Result<(), SetLoggerError> {
    try_init_with_default_filter("info")
}

/// Attempt to init a env_logger. `RUST_LOG` still takes precedence over `default_filter`,
/// so a test can ask for `trace` output of the chooser's liveness tables while a user
/// keeps overriding it from the environment.
pub fn try_init_with_default_filter(default_filter: &str) -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_filter),
            )
        } else {
            let _ = default_filter;
            Ok(())
        }
    }
}

/// Init logging for unit and integration tests. A logger may already be installed by
/// another test in the same process, which is fine.
pub fn init_for_test() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
            )
            .is_test(true)
            .try_init();
        }
    }
}
