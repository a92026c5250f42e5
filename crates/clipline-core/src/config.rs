//! Runtime configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::models::Stage;
pub use crate::orchestration::RetryPolicy;

pub const DEFAULT_QUALITY: &str = "360p";

/// Settings for the workflow runtime and the command-line tool.
///
/// Every field has a default so an embedding works without any environment
/// variables set.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// SQLite database file (default: `"clipline.sqlite3"`).
    pub database_path: PathBuf,

    /// `tracing` filter string used when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Continue from `waiting_transcription` without a manual trigger.
    pub auto_transcription: bool,

    /// Continue from `waiting_shorts` without a manual trigger.
    pub auto_shorts: bool,

    /// On restart, re-dispatch stages that were running instead of failing
    /// their tasks.
    pub resume_interrupted: bool,

    pub dispatch_retry: RetryPolicy,

    /// Applied to store writes that fail with a concurrency conflict.
    pub store_retry: RetryPolicy,

    /// Buffer size of the broadcast notifier.
    pub notify_capacity: usize,

    pub default_quality: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("clipline.sqlite3"),
            log_filter: "info".to_string(),
            auto_transcription: false,
            auto_shorts: true,
            resume_interrupted: false,
            dispatch_retry: RetryPolicy::new(3, Duration::from_millis(250)),
            store_retry: RetryPolicy::new(5, Duration::from_millis(20)),
            notify_capacity: 256,
            default_quality: DEFAULT_QUALITY.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Build a [`RuntimeConfig`] from `CLIPLINE_*` environment variables,
    /// falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_path: lookup("CLIPLINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            log_filter: lookup("CLIPLINE_LOG").unwrap_or(defaults.log_filter),
            auto_transcription: parse_flag(
                lookup("CLIPLINE_AUTO_TRANSCRIPTION"),
                defaults.auto_transcription,
            ),
            auto_shorts: parse_flag(lookup("CLIPLINE_AUTO_SHORTS"), defaults.auto_shorts),
            resume_interrupted: parse_flag(
                lookup("CLIPLINE_RESUME_INTERRUPTED"),
                defaults.resume_interrupted,
            ),
            dispatch_retry: RetryPolicy {
                max_attempts: parse_or(
                    lookup("CLIPLINE_DISPATCH_ATTEMPTS"),
                    defaults.dispatch_retry.max_attempts,
                ),
                initial_backoff: parse_millis(
                    lookup("CLIPLINE_DISPATCH_BACKOFF_MS"),
                    defaults.dispatch_retry.initial_backoff,
                ),
                ..defaults.dispatch_retry
            },
            store_retry: RetryPolicy {
                max_attempts: parse_or(
                    lookup("CLIPLINE_STORE_ATTEMPTS"),
                    defaults.store_retry.max_attempts,
                ),
                initial_backoff: parse_millis(
                    lookup("CLIPLINE_STORE_BACKOFF_MS"),
                    defaults.store_retry.initial_backoff,
                ),
                ..defaults.store_retry
            },
            notify_capacity: parse_or(lookup("CLIPLINE_NOTIFY_CAPACITY"), defaults.notify_capacity)
                .max(1),
            default_quality: lookup("CLIPLINE_DEFAULT_QUALITY")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.default_quality),
        }
    }

    pub fn auto_releases(&self, stage: Stage) -> bool {
        match stage {
            Stage::WaitingTranscription => self.auto_transcription,
            Stage::WaitingShorts => self.auto_shorts,
            _ => false,
        }
    }
}

fn parse_flag(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::trim) {
        Some(value) if value == "1" || value.eq_ignore_ascii_case("true") => true,
        Some(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_millis(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
