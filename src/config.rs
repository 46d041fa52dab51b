use std::str::FromStr;
use std::time::Duration;

use crate::grid::Density;
use crate::limits::*;

/// Runtime knobs, read from `TAPECHART_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartConfig {
    pub poll_interval: Duration,
    /// Bounds polls and push-triggered fetches.
    pub fetch_timeout: Duration,
    pub max_undo: usize,
    pub degraded_after: u32,
    pub density: Density,
    pub metrics_port: Option<u16>,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_undo: DEFAULT_MAX_UNDO_DEPTH,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            density: Density::default(),
            metrics_port: None,
        }
    }
}

impl ChartConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let poll_interval = parsed("TAPECHART_POLL_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let fetch_timeout = parsed("TAPECHART_FETCH_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.fetch_timeout);
        let max_undo = parsed("TAPECHART_MAX_UNDO")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(defaults.max_undo);
        let degraded_after = parsed("TAPECHART_DEGRADED_AFTER")
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.degraded_after);
        let density = lookup("TAPECHART_DENSITY")
            .and_then(|s| Density::from_str(&s).ok())
            .unwrap_or(defaults.density);
        let metrics_port = lookup("TAPECHART_METRICS_PORT").and_then(|s| s.trim().parse().ok());

        Self {
            poll_interval,
            fetch_timeout,
            max_undo,
            degraded_after,
            density,
            metrics_port,
        }
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
        let config = ChartConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ChartConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_undo, 50);
        assert_eq!(config.density, Density::Comfortable);
    }

    #[test]
    fn reads_overrides() {
        let config = ChartConfig::from_lookup(lookup(&[
            ("TAPECHART_POLL_INTERVAL_MS", "250"),
            ("TAPECHART_FETCH_TIMEOUT_MS", "1000"),
            ("TAPECHART_MAX_UNDO", "10"),
            ("TAPECHART_DEGRADED_AFTER", "5"),
            ("TAPECHART_DENSITY", "compact"),
            ("TAPECHART_METRICS_PORT", "9100"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.fetch_timeout, Duration::from_secs(1));
        assert_eq!(config.max_undo, 10);
        assert_eq!(config.degraded_after, 5);
        assert_eq!(config.density, Density::Compact);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back() {
        let config = ChartConfig::from_lookup(lookup(&[
            ("TAPECHART_POLL_INTERVAL_MS", "soon"),
            ("TAPECHART_MAX_UNDO", "0"),
            ("TAPECHART_DENSITY", "cozy"),
        ]));
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.max_undo, DEFAULT_MAX_UNDO_DEPTH);
        assert_eq!(config.density, Density::Comfortable);
    }
}
