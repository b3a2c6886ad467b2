//! Aggregator configuration.

/// Group lifecycle settings for the aggregator.
///
/// # Examples
///
/// ```
/// use correlator_runtime::config::AggregatorConfig;
///
/// let config = AggregatorConfig::default().with_expire_groups_upon_completion(false);
/// assert!(config.complete_groups_when_empty);
/// assert!(!config.expire_groups_upon_completion);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Complete a group once it has been drained to zero messages
    pub complete_groups_when_empty: bool,
    /// Delete a group as soon as it completes. When `false` the completed
    /// group stays as a sentinel and later arrivals for its key are
    /// discarded.
    pub expire_groups_upon_completion: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorConfig {
    /// Both settings enabled.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            complete_groups_when_empty: true,
            expire_groups_upon_completion: true,
        }
    }

    /// Set [`complete_groups_when_empty`](Self::complete_groups_when_empty).
    #[must_use]
    pub const fn with_complete_groups_when_empty(mut self, value: bool) -> Self {
        self.complete_groups_when_empty = value;
        self
    }

    /// Set [`expire_groups_upon_completion`](Self::expire_groups_upon_completion).
    #[must_use]
    pub const fn with_expire_groups_upon_completion(mut self, value: bool) -> Self {
        self.expire_groups_upon_completion = value;
        self
    }
}
