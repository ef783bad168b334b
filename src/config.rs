//! Configuration for the lifecycle core.

use std::time::Duration;

use crate::handle::HandleWidth;
use crate::text::{DEFAULT_TEXT_CACHE_CAPACITY, DEFAULT_TEXT_CACHE_MAX_KEY_LEN};

/// Parameters controlling handle width, the text cache and reclamation.
///
/// # Examples
///
/// ```
/// use handlegrip::config::CoreConfig;
/// use handlegrip::handle::HandleWidth;
/// use std::time::Duration;
///
/// let default_config = CoreConfig::default();
/// assert_eq!(default_config.text_cache_capacity, 1_000_000);
/// assert!(!default_config.background_reclaim);
///
/// let custom = CoreConfig::default()
///     .with_handle_width(HandleWidth::Narrow)
///     .with_text_cache_capacity(64 * 1024)
///     .with_background_reclaim(Duration::from_millis(10));
///
/// assert_eq!(custom.handle_width, HandleWidth::Narrow);
/// assert!(custom.background_reclaim);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Word width of handles produced by the collaborator
    pub handle_width: HandleWidth,
    /// Total weight budget of the text decode cache
    pub text_cache_capacity: usize,
    /// Keys longer than this bypass the text cache
    pub text_cache_max_key_len: usize,
    /// Start the background sweeper when a graph is created
    pub background_reclaim: bool,
    /// Wake-up interval of the background sweeper
    pub reclaim_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            handle_width: HandleWidth::native(),
            text_cache_capacity: DEFAULT_TEXT_CACHE_CAPACITY,
            text_cache_max_key_len: DEFAULT_TEXT_CACHE_MAX_KEY_LEN,
            background_reclaim: false,
            reclaim_interval: Duration::from_millis(100),
        }
    }
}

impl CoreConfig {
    pub fn with_handle_width(mut self, width: HandleWidth) -> Self {
        self.handle_width = width;
        self
    }

    pub fn with_text_cache_capacity(mut self, capacity: usize) -> Self {
        self.text_cache_capacity = capacity;
        self
    }

    pub fn with_text_cache_max_key_len(mut self, max_key_len: usize) -> Self {
        self.text_cache_max_key_len = max_key_len;
        self
    }

    /// Enable the background sweeper with the given wake-up interval.
    pub fn with_background_reclaim(mut self, interval: Duration) -> Self {
        self.background_reclaim = true;
        self.reclaim_interval = interval;
        self
    }
}
