//! Logging setup for scanverify.
//!
//! Uses the `log` facade with the `env_logger` backend, writing to stderr so
//! that operator-facing status on stdout stays clean. The level comes from (in
//! priority order):
//!
//! 1. `RUST_LOG` (if set)
//! 2. `--quiet` (errors only) or `--verbose` (debug, trace)
//! 3. Default: warn, so mismatches and configuration problems are visible
//!
//! Debug builds prefix a timestamp; `-v` adds the emitting module.
//!
//! ```rust,no_run
//! use scanverify::logging::init_logging;
//!
//! init_logging(1, false);
//! log::debug!("Resolver ready");
//! ```

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;
use std::io::Write;

/// Initialize logging from the CLI verbosity flags.
///
/// Call before any logging. Later calls leave the first logger in place.
pub fn init_logging(verbose: u8, quiet: bool) {
    let mut builder = Builder::new();
    builder.target(Target::Stderr);

    let from_env = env::var("RUST_LOG").is_ok();
    if from_env {
        builder.parse_default_env();
    } else {
        builder.filter_level(determine_level(verbose, quiet));
    }
    configure_format(&mut builder, verbose);
    if builder.try_init().is_err() {
        return;
    }

    if from_env {
        log::debug!("Log filter taken from RUST_LOG");
    } else {
        log::debug!("Log level {:?}", determine_level(verbose, quiet));
    }
}

fn determine_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Module path relative to the crate, e.g. `verify::manager`.
fn short_target(target: &str) -> &str {
    target.strip_prefix("scanverify::").unwrap_or(target)
}

fn configure_format(builder: &mut Builder, verbose: u8) {
    let with_module = verbose >= 1;
    builder.format(move |buf, record| {
        let level = record.level();
        let style = buf.default_level_style(level);

        #[cfg(debug_assertions)]
        write!(buf, "{} ", buf.timestamp_seconds())?;

        write!(buf, "{style}{:<5}{style:#} ", level)?;
        if with_module {
            write!(buf, "[{}] ", short_target(record.target()))?;
        }
        writeln!(buf, "{}", record.args())
    });
}
