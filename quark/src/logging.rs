pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a terminal logger from the default config. Library code never calls this; the
/// binaries and tests that want output do.
pub fn term_logger() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Malformed logger config");

    config.build_logger().expect("Logger construction failed")
}

/// Resolves the optional parent logger idiom used throughout the networking stack. A `None`
/// parent produces a logger that discards everything.
#[inline]
pub fn child_logger<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}
