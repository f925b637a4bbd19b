//! Provide tracing, tailored to this crate's binaries.
//!
//! Binaries call one of the init_* functions once at startup to install a
//! tracing subscriber. Library code only emits events through the macros
//! re-exported in [`prelude`], so embedders remain free to install their
//! own subscriber instead.

use std::env;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            init_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        init_stdout();
    }
}

/// Log to stdout, filtering according to the environment variable
/// RUST_LOG, overriding the default level (ERROR) to INFO.
pub fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(ClockTimer))
        .init();
}

// Timestamps in local time to the nearest second; the stock timer prints
// a long UTC string that drowns out the interactive log.
struct ClockTimer;

impl FormatTime for ClockTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .unwrap(),
        )
    }
}
