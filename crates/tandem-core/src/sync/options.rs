//! Engine options

use std::time::Duration;

/// Default grace period for superseded generations
pub const DEFAULT_OUTDATED_TIMEOUT_MS: u64 = 1000;
/// Shortest accepted grace period
pub const MIN_OUTDATED_TIMEOUT_MS: u64 = 500;
/// Default buffer window
pub const DEFAULT_BUFFER_LIFE_MS: u64 = 100;
/// Longest accepted buffer window
pub const MAX_BUFFER_LIFE_MS: u64 = 2000;

/// Behavior switches of a synchronization engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Ignore remote changes entirely
    pub isolated: bool,
    /// Persist every change immediately instead of buffering bursts
    pub plain_actions: bool,
    /// How long a superseded generation keeps its listener
    pub outdated_timeout: Duration,
    /// Length of a buffer window
    pub buffer_life: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            isolated: false,
            plain_actions: false,
            outdated_timeout: Duration::from_millis(DEFAULT_OUTDATED_TIMEOUT_MS),
            buffer_life: Duration::from_millis(DEFAULT_BUFFER_LIFE_MS),
        }
    }
}

impl EngineOptions {
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn plain_actions(mut self, plain_actions: bool) -> Self {
        self.plain_actions = plain_actions;
        self
    }

    /// Set the outdated timeout; 0 selects the default, short values are raised
    pub fn outdated_timeout_ms(mut self, ms: u64) -> Self {
        self.outdated_timeout = Duration::from_millis(clamp_outdated_timeout(ms));
        self
    }

    /// Set the buffer window; 0 selects the default, long values are capped
    pub fn buffer_life_ms(mut self, ms: u64) -> Self {
        self.buffer_life = Duration::from_millis(clamp_buffer_life(ms));
        self
    }
}

pub fn clamp_outdated_timeout(ms: u64) -> u64 {
    if ms == 0 {
        DEFAULT_OUTDATED_TIMEOUT_MS
    } else {
        ms.max(MIN_OUTDATED_TIMEOUT_MS)
    }
}

pub fn clamp_buffer_life(ms: u64) -> u64 {
    if ms == 0 {
        DEFAULT_BUFFER_LIFE_MS
    } else {
        ms.min(MAX_BUFFER_LIFE_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert!(!options.isolated);
        assert!(!options.plain_actions);
        assert_eq!(options.outdated_timeout, Duration::from_millis(1000));
        assert_eq!(options.buffer_life, Duration::from_millis(100));
    }

    #[test]
    fn test_clamping() {
        let options = EngineOptions::default()
            .outdated_timeout_ms(10)
            .buffer_life_ms(60_000);
        assert_eq!(options.outdated_timeout, Duration::from_millis(500));
        assert_eq!(options.buffer_life, Duration::from_millis(2000));

        let options = options.buffer_life_ms(0).outdated_timeout_ms(1500);
        assert_eq!(options.buffer_life, Duration::from_millis(100));
        assert_eq!(options.outdated_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_zero_outdated_timeout_selects_default() {
        let options = EngineOptions::default().outdated_timeout_ms(0);
        assert_eq!(options.outdated_timeout, Duration::from_millis(1000));
        assert_eq!(clamp_outdated_timeout(1), 500);
    }
}
