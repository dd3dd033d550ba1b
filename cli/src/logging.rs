//! Log setup for the `tilefeed` binary.
//!
//! Logs go to stderr so that `--json` command output on stdout stays
//! machine-readable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The `log:` section of `tilefeed.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything without a component entry.
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-crate levels, keyed by crate name (`tilefeed-stream: debug`).
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// One JSON object per line instead of the text format.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives, components in name order,
    /// e.g. `"info,tilefeed_indexer=trace,tilefeed_stream=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        components.into_iter().fold(self.level.clone(), |mut acc, (crate_name, level)| {
            acc.push(',');
            acc.push_str(&crate_name.replace('-', "_"));
            acc.push('=');
            acc.push_str(level);
            acc
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.directives()))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. `RUST_LOG` replaces the configured
/// directives when set; unparseable directives fall back to `info`.
pub fn init_tracing(config: &LogConfig) {
    let registry = tracing_subscriber::registry().with(config.filter());
    if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
