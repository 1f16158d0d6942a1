//! Structured logging setup.
//!
//! Log lines carry a compact `HH:MM:SS.mmm` timestamp and the emitting
//! target. Levels come from the `[logging]` config section; `RUST_LOG`
//! overrides it entirely when set.
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.modules]
//! "aiha::ingest" = "debug"
//! ```
//!
//! Output goes to stderr so command results on stdout stay pipeable.

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Build the filter directive string for a logging config.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.default.clone();
    for (module, level) in &config.modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(CompactTime)
            .with_level(true)
            .with_writer(std::io::stderr)
            .with_filter(filter);

        // A test harness may already have installed a subscriber.
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_filter_directives() {
        let mut modules = BTreeMap::new();
        modules.insert("aiha::chat".to_string(), "debug".to_string());
        modules.insert("sqlx".to_string(), "warn".to_string());
        let cfg = LoggingConfig {
            default: "info".into(),
            modules,
        };
        assert_eq!(filter_directives(&cfg), "info,aiha::chat=debug,sqlx=warn");
    }
}
