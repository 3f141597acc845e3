//! Construction time configuration of the stacks.

use crate::error::Status;
use crate::tagged_ptr::TaggedIndex;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const DEFAULT_MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const DEFAULT_MAX_THREAD_COUNT: usize = 256;
    } else if #[cfg(feature = "max_thread_count_16")] {
        pub const DEFAULT_MAX_THREAD_COUNT: usize = 16;
    } else {
        /// Default size of the hazard slot table
        pub const DEFAULT_MAX_THREAD_COUNT: usize = 64;
    }
}

/// Without an explicit threshold a drain pass starts at `max_threads * CLEANUP_THRESHOLD_FACTOR`
/// staged nodes.
pub const CLEANUP_THRESHOLD_FACTOR: usize = 2;

/// Pending nodes older than this (microseconds) trigger a drain pass even below the threshold.
pub const DEFAULT_DRAIN_INTERVAL_US: i64 = 200_000;

/// Where nodes wait while some thread may still observe them.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Quarantine {
    /// One lock-free list shared by every thread; any thread may drain it
    Global,
    /// One vector per hazard slot; only the owning thread stages and drains
    ThreadLocal,
}

/// Settings of the hazard pointer scheme.
#[derive(Clone, Debug)]
pub struct HazardConfig {
    /// Size of the slot table, maximum number of threads popping from one stack
    pub max_threads: usize,
    /// Staged count that triggers a drain pass, `None` scales it with `max_threads`
    pub cleanup_threshold: Option<usize>,
    /// Maximum age of pending nodes in microseconds, `0` disables the time trigger
    pub drain_interval_us: i64,
    pub quarantine: Quarantine,
}

impl Default for HazardConfig {
    fn default() -> Self {
        HazardConfig {
            max_threads: DEFAULT_MAX_THREAD_COUNT,
            cleanup_threshold: None,
            drain_interval_us: DEFAULT_DRAIN_INTERVAL_US,
            quarantine: Quarantine::Global,
        }
    }
}

impl HazardConfig {
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn cleanup_threshold(mut self, cleanup_threshold: usize) -> Self {
        self.cleanup_threshold = Some(cleanup_threshold);
        self
    }

    pub fn drain_interval_us(mut self, drain_interval_us: i64) -> Self {
        self.drain_interval_us = drain_interval_us;
        self
    }

    pub fn quarantine(mut self, quarantine: Quarantine) -> Self {
        self.quarantine = quarantine;
        self
    }

    /// Staged count at which a drain pass really starts.
    ///
    /// At most `max_threads` staged nodes can be watched at once, so the threshold is kept above
    /// that. Otherwise a quarantine full of watched nodes would drain on every retire.
    pub fn drain_threshold(&self) -> usize {
        let wanted = self
            .cleanup_threshold
            .unwrap_or_else(|| self.max_threads.saturating_mul(CLEANUP_THRESHOLD_FACTOR));
        wanted.max(self.max_threads.saturating_add(1))
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.max_threads == 0 || self.cleanup_threshold == Some(0) || self.drain_interval_us < 0
        {
            warn!("invalid hazard config, config={:?}", self);
            return Err(Status::InvalidParam);
        }
        Ok(())
    }
}

/// Settings of the bounded pool scheme.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of pre-allocated node slots
    pub capacity: usize,
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        PoolConfig { capacity }
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.capacity == 0 || self.capacity > TaggedIndex::MAX_INDEX as usize + 1 {
            warn!("invalid pool capacity, capacity={}", self.capacity);
            return Err(Status::InvalidParam);
        }
        Ok(())
    }
}

/// Which stack `stack::build` constructs.
#[derive(Clone, Debug)]
pub enum StackConfig {
    Bounded(PoolConfig),
    Hazard(HazardConfig),
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig::Hazard(HazardConfig::default())
    }
}

impl StackConfig {
    pub fn bounded(capacity: usize) -> Self {
        StackConfig::Bounded(PoolConfig::new(capacity))
    }

    pub fn hazard(max_threads: usize) -> Self {
        StackConfig::Hazard(HazardConfig::default().max_threads(max_threads))
    }

    pub fn validate(&self) -> Result<(), Status> {
        match self {
            StackConfig::Bounded(c) => c.validate(),
            StackConfig::Hazard(c) => c.validate(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(StackConfig::default().validate().is_ok());
        assert!(HazardConfig::default().validate().is_ok());
        assert!(StackConfig::bounded(1).validate().is_ok());
    }

    #[test]
    fn test_drain_threshold_stays_above_watched_bound() {
        let c = HazardConfig::default();
        assert_eq!(
            c.drain_threshold(),
            DEFAULT_MAX_THREAD_COUNT * CLEANUP_THRESHOLD_FACTOR
        );
        assert_eq!(HazardConfig::default().max_threads(8).drain_threshold(), 16);
        assert_eq!(
            HazardConfig::default()
                .max_threads(8)
                .cleanup_threshold(100)
                .drain_threshold(),
            100
        );
        assert_eq!(
            HazardConfig::default()
                .max_threads(8)
                .cleanup_threshold(4)
                .drain_threshold(),
            9
        );
    }

    #[test]
    fn test_invalid_params() {
        assert_eq!(
            StackConfig::bounded(0).validate(),
            Err(Status::InvalidParam)
        );
        assert_eq!(StackConfig::hazard(0).validate(), Err(Status::InvalidParam));
        assert_eq!(
            HazardConfig::default().cleanup_threshold(0).validate(),
            Err(Status::InvalidParam)
        );
        assert_eq!(
            HazardConfig::default().drain_interval_us(-1).validate(),
            Err(Status::InvalidParam)
        );
    }
}
