//! Logger bootstrap. Components never construct drains themselves; they
//! receive a `Logger` and derive children with `log.new(o!(...))`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LogInitError {
    Config(String),
    Build(String),
}

/// Builds the process root logger from a sloggers TOML snippet. `None`
/// yields the default terminal logger on stderr.
pub fn root_logger(config_toml: Option<&str>) -> Result<Logger, LogInitError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config_toml.unwrap_or(DEFAULT_CONFIG))
        .map_err(|err| LogInitError::Config(err.to_string()))?;

    config
        .build_logger()
        .map_err(|err| LogInitError::Build(err.to_string()))
}

/// A logger that swallows everything. Used by components constructed
/// without a parent logger, mirroring their test configuration.
#[inline]
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a usable child.
#[inline]
pub fn child_of<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => null_logger(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        root_logger(None).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = root_logger(Some("type = \"no-such-drain\""));
        assert!(result.is_err());
    }

    #[test]
    fn test_null_logger_discards() {
        let log = null_logger();
        debug!(log, "dropped"; "key" => 1);
    }
}
