//! Engine configuration loaded from `STORYFORGE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// The cleanup sweep only fails jobs the watchdog has had many chances to resume.
const CLEANUP_TO_STALE_RATIO: u32 = 10;

/// Tunables for the executor, the finalization gate and the sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Inactivity after which an active job counts as stuck.
    pub stale_after: Duration,
    /// Watchdog resumes per job before it gives up.
    pub max_auto_resume: u32,
    pub watchdog_batch: usize,
    /// Inactivity after which the cleanup sweep fails a job outright.
    pub cleanup_after: Duration,
    pub sweep_interval: Duration,
    /// How long a tick holds its claim on a job.
    pub tick_lease: Duration,
    pub max_section_rewrites: u32,
    pub cover_timeout: Duration,
    /// Quality-gate attempts per cover generation.
    pub cover_max_attempts: u32,
    pub cover_max_generations: u32,
    pub font_dir: PathBuf,
    pub asset_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            max_auto_resume: 20,
            watchdog_batch: 10,
            cleanup_after: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            tick_lease: Duration::from_secs(240),
            max_section_rewrites: 3,
            cover_timeout: Duration::from_secs(300),
            cover_max_attempts: 3,
            cover_max_generations: 3,
            font_dir: PathBuf::from("assets/fonts"),
            asset_dir: PathBuf::from("data/covers"),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_secs(parse(&lookup, var, default.as_secs())?))
        };

        let config = Self {
            stale_after: secs("STORYFORGE_STALE_AFTER_SECS", d.stale_after)?,
            max_auto_resume: parse(&lookup, "STORYFORGE_MAX_AUTO_RESUME", d.max_auto_resume)?,
            watchdog_batch: parse(&lookup, "STORYFORGE_WATCHDOG_BATCH", d.watchdog_batch)?,
            cleanup_after: secs("STORYFORGE_CLEANUP_AFTER_SECS", d.cleanup_after)?,
            sweep_interval: secs("STORYFORGE_SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            tick_lease: secs("STORYFORGE_TICK_LEASE_SECS", d.tick_lease)?,
            max_section_rewrites: parse(
                &lookup,
                "STORYFORGE_MAX_SECTION_REWRITES",
                d.max_section_rewrites,
            )?,
            cover_timeout: secs("STORYFORGE_COVER_TIMEOUT_SECS", d.cover_timeout)?,
            cover_max_attempts: parse(&lookup, "STORYFORGE_COVER_MAX_ATTEMPTS", d.cover_max_attempts)?,
            cover_max_generations: parse(
                &lookup,
                "STORYFORGE_COVER_MAX_GENERATIONS",
                d.cover_max_generations,
            )?,
            font_dir: lookup("STORYFORGE_FONT_DIR").map_or(d.font_dir, PathBuf::from),
            asset_dir: lookup("STORYFORGE_ASSET_DIR").map_or(d.asset_dir, PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_lease >= self.stale_after {
            return Err(ConfigError::Inconsistent(
                "tick lease must be shorter than the staleness window".into(),
            ));
        }
        if self.cleanup_after < self.stale_after.saturating_mul(CLEANUP_TO_STALE_RATIO) {
            return Err(ConfigError::Inconsistent(format!(
                "cleanup window must be at least {CLEANUP_TO_STALE_RATIO}x the staleness window"
            )));
        }
        if self.cover_max_attempts == 0 || self.cover_max_generations == 0 {
            return Err(ConfigError::Inconsistent(
                "cover attempts and generations must be at least 1".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Inconsistent("sweep interval must be positive".into()));
        }
        Ok(())
    }

    pub fn stale_after_chrono(&self) -> chrono::Duration {
        to_chrono(self.stale_after)
    }

    pub fn cleanup_after_chrono(&self) -> chrono::Duration {
        to_chrono(self.cleanup_after)
    }

    pub fn tick_lease_chrono(&self) -> chrono::Duration {
        to_chrono(self.tick_lease)
    }

    pub fn cover_timeout_chrono(&self) -> chrono::Duration {
        to_chrono(self.cover_timeout)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.max_auto_resume, 20);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("STORYFORGE_STALE_AFTER_SECS", "600"),
            ("STORYFORGE_CLEANUP_AFTER_SECS", "7200"),
            ("STORYFORGE_WATCHDOG_BATCH", " 25 "),
            ("STORYFORGE_FONT_DIR", "/usr/share/fonts/storyforge"),
        ]))
        .unwrap();
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.watchdog_batch, 25);
        assert_eq!(config.font_dir, PathBuf::from("/usr/share/fonts/storyforge"));
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("STORYFORGE_MAX_AUTO_RESUME", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STORYFORGE_MAX_AUTO_RESUME", .. }));
    }

    #[test]
    fn lease_must_expire_before_the_watchdog_looks() {
        let err = EngineConfig::from_lookup(lookup(&[("STORYFORGE_TICK_LEASE_SECS", "300")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn cleanup_window_must_dwarf_the_staleness_window() {
        let err = EngineConfig::from_lookup(lookup(&[("STORYFORGE_CLEANUP_AFTER_SECS", "1800")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(msg) if msg.contains("10x")));

        let config = EngineConfig::from_lookup(lookup(&[("STORYFORGE_CLEANUP_AFTER_SECS", "3000")]))
            .unwrap();
        assert_eq!(config.cleanup_after, Duration::from_secs(3000));
    }
}
