use std::time::Duration;

/// Tunables for evaluation and auto-generate runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Deadline for every signal, rule and narrative store call.
    pub store_timeout: Duration,
    /// Rules evaluated at the same time.
    pub max_concurrent_rules: usize,
    /// Signal kinds accepted in rules beyond the built-in ones.
    pub extra_signal_kinds: Vec<String>,
    /// Only signals whose period ends within this many days are in scope.
    pub lookback_days: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(5_000),
            max_concurrent_rules: 8,
            extra_signal_kinds: Vec::new(),
            lookback_days: None,
        }
    }
}

impl EngineConfig {
    pub fn with_store_timeout_ms(mut self, millis: u64) -> Self {
        self.store_timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_max_concurrent_rules(mut self, max: usize) -> Self {
        self.max_concurrent_rules = max.max(1);
        self
    }

    pub fn with_extra_signal_kinds(mut self, kinds: Vec<String>) -> Self {
        self.extra_signal_kinds = kinds;
        self
    }

    pub fn with_lookback_days(mut self, days: Option<i64>) -> Self {
        self.lookback_days = days.map(|d| d.max(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = EngineConfig::default()
            .with_max_concurrent_rules(0)
            .with_lookback_days(Some(0))
            .with_store_timeout_ms(250);
        assert_eq!(config.max_concurrent_rules, 1);
        assert_eq!(config.lookback_days, Some(1));
        assert_eq!(config.store_timeout, Duration::from_millis(250));
    }
}
