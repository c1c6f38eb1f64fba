//! Flat key/value configuration, loaded from a simple text file.
//!
//! Mirrors the original framework's `MainConfig::get<T>(name, default)`
//! pattern: every subsystem reads its own handful of keys out of one flat
//! namespace, each with a hard-coded default, so a missing key is never a
//! hard error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// A flat `key = value` configuration store.
///
/// Construct one with [`Config::load_file`], [`Config::from_pairs`], or
/// [`Config::builder`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Parses a config file of `key = value` lines. Blank lines and lines
    /// starting with `#` are ignored. Leading/trailing whitespace around
    /// keys and values is trimmed.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut values = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("{}:{}: missing '='", path.as_ref().display(), lineno + 1))
            })?;
            values.insert(key.trim().to_owned(), value.trim().to_owned());
        }
        Ok(Self { values })
    }

    /// Builds a config directly from pairs, mainly useful in tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Starts building a [`Config`] programmatically.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| default.to_owned())
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(String::as_str) {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_duration_ms(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.get_u64(key, default_ms))
    }

    /// Clamps a thread-count-style value into `1..=max`, logging if the
    /// configured value was out of range, matching `do_get_size_config` in
    /// the original worker pool.
    pub fn get_clamped_usize(&self, key: &str, max: usize, default: usize) -> usize {
        let raw = self.get_i64(key, default as i64);
        let clamped = raw.clamp(1, max as i64) as usize;
        if clamped as i64 != raw {
            log::warn!("config value `{key}` truncated to `{clamped}` [value `{raw}` out of range]");
        }
        clamped
    }
}

/// Incrementally builds a [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    values: HashMap<String, String>,
}

impl ConfigBuilder {
    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(key.into(), value.to_string());
        self
    }

    pub fn build(self) -> Config {
        Config { values: self.values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_file_syntax() {
        let cfg = Config::from_pairs([
            ("worker.thread_count", "4"),
            ("mysql_use_ssl", "true"),
            ("mysql_dump_dir", "/tmp/dumps"),
        ]);
        assert_eq!(cfg.get_u64("worker.thread_count", 1), 4);
        assert!(cfg.get_bool("mysql_use_ssl", false));
        assert_eq!(cfg.get_str("mysql_dump_dir", ""), "/tmp/dumps");
        assert_eq!(cfg.get_str("missing_key", "fallback"), "fallback");
    }

    #[test]
    fn clamps_thread_count() {
        let cfg = Config::from_pairs([("worker.thread_count", "9001")]);
        assert_eq!(cfg.get_clamped_usize("worker.thread_count", 256, 1), 256);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let dir = std::env::temp_dir().join(format!("poseidon_cfg_test_{}", std::process::id()));
        fs::write(&dir, "# a comment\n\nworker.thread_count = 7\n").unwrap();
        let cfg = Config::load_file(&dir).unwrap();
        fs::remove_file(&dir).ok();
        assert_eq!(cfg.get_u64("worker.thread_count", 1), 7);
    }
}
