use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    BLOCK_SIZE, CACHE_EXPIRY, DEFAULT_CACHE_BLOCKS, FILE_POOL_SIZE, MAX_AIO_THREADS,
    MAX_CACHE_BLOCKS, MAX_HASHING_THREADS, MIN_AIO_THREADS, MIN_GHOST_PIECES,
    THREAD_IDLE_TIMEOUT, TRIM_HEADROOM, WRITE_CACHE_LINE_SIZE,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("block size must be a non-zero power of two, got {0}")]
    InvalidBlockSize(usize),

    #[error("block size is fixed at {0} once the disk I/O thread runs")]
    BlockSizeFixed(usize),

    #[error("cache size must be between 1 and {max} blocks, got {got}")]
    InvalidCacheSize { got: usize, max: usize },

    #[error("{pool} pool: min threads {min} exceeds max threads {max}")]
    InvalidThreadRange {
        pool: &'static str,
        min: usize,
        max: usize,
    },

    #[error("the generic I/O pool needs at least one thread")]
    NoIoThreads,

    #[error("file pool size must be at least 1")]
    EmptyFilePool,

    #[error("trim headroom must be in (0, 1], got {0}")]
    InvalidTrimHeadroom(f32),

    #[error("thread idle timeout must be non-zero")]
    ZeroIdleTimeout,
}

/// Thread limits of one worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Workers kept alive while idle.
    pub min_threads: usize,
    pub max_threads: usize,
}

impl PoolSettings {
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self {
            min_threads,
            max_threads,
        }
    }
}

/// Configuration of the disk I/O thread.
///
/// Build one from [`Default`] and adjust it with the `with_*` methods.
///
/// ```
/// use rbit_disk::disk::{DiskSettings, PoolSettings};
///
/// let settings = DiskSettings::default()
///     .with_cache_size(4096)
///     .with_hashing_threads(PoolSettings::new(0, 2));
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DiskSettings {
    pub block_size: usize,
    /// Cache capacity in blocks. Also the budget of the buffer allocator.
    pub cache_size: usize,
    pub use_read_cache: bool,
    pub use_write_cache: bool,
    /// Honour the volatile flag of read jobs. When off, volatile reads are
    /// cached like any other read.
    pub volatile_read_cache: bool,
    /// Hashed dirty blocks a piece collects before they are flushed.
    pub write_cache_line_size: usize,
    pub cache_expiry: Duration,
    pub file_pool_size: usize,
    pub aio_threads: PoolSettings,
    /// A maximum of zero runs hash jobs on the generic pool.
    pub hashing_threads: PoolSettings,
    pub thread_idle_timeout: Duration,
    /// Pieces remembered by each ghost list. `None` derives it from the
    /// cache size.
    pub ghost_size: Option<usize>,
    /// Fraction of the cache freed by a trim triggered by allocation pressure.
    pub trim_headroom: f32,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            cache_size: DEFAULT_CACHE_BLOCKS,
            use_read_cache: true,
            use_write_cache: true,
            volatile_read_cache: true,
            write_cache_line_size: WRITE_CACHE_LINE_SIZE,
            cache_expiry: CACHE_EXPIRY,
            file_pool_size: FILE_POOL_SIZE,
            aio_threads: PoolSettings::new(MIN_AIO_THREADS, MAX_AIO_THREADS),
            hashing_threads: PoolSettings::new(0, MAX_HASHING_THREADS),
            thread_idle_timeout: THREAD_IDLE_TIMEOUT,
            ghost_size: None,
            trim_headroom: TRIM_HEADROOM,
        }
    }
}

impl DiskSettings {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_cache_size(mut self, blocks: usize) -> Self {
        self.cache_size = blocks;
        self
    }

    pub fn with_read_cache(mut self, enabled: bool) -> Self {
        self.use_read_cache = enabled;
        self
    }

    pub fn with_write_cache(mut self, enabled: bool) -> Self {
        self.use_write_cache = enabled;
        self
    }

    pub fn with_volatile_read_cache(mut self, enabled: bool) -> Self {
        self.volatile_read_cache = enabled;
        self
    }

    pub fn with_write_cache_line_size(mut self, blocks: usize) -> Self {
        self.write_cache_line_size = blocks;
        self
    }

    pub fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache_expiry = expiry;
        self
    }

    pub fn with_file_pool_size(mut self, handles: usize) -> Self {
        self.file_pool_size = handles;
        self
    }

    pub fn with_aio_threads(mut self, pool: PoolSettings) -> Self {
        self.aio_threads = pool;
        self
    }

    pub fn with_hashing_threads(mut self, pool: PoolSettings) -> Self {
        self.hashing_threads = pool;
        self
    }

    pub fn with_thread_idle_timeout(mut self, timeout: Duration) -> Self {
        self.thread_idle_timeout = timeout;
        self
    }

    pub fn with_ghost_size(mut self, pieces: usize) -> Self {
        self.ghost_size = Some(pieces);
        self
    }

    pub fn with_trim_headroom(mut self, fraction: f32) -> Self {
        self.trim_headroom = fraction;
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(SettingsError::InvalidBlockSize(self.block_size));
        }
        if self.cache_size == 0 || self.cache_size > MAX_CACHE_BLOCKS {
            return Err(SettingsError::InvalidCacheSize {
                got: self.cache_size,
                max: MAX_CACHE_BLOCKS,
            });
        }
        for (pool, limits) in [("aio", self.aio_threads), ("hashing", self.hashing_threads)] {
            if limits.min_threads > limits.max_threads {
                return Err(SettingsError::InvalidThreadRange {
                    pool,
                    min: limits.min_threads,
                    max: limits.max_threads,
                });
            }
        }
        if self.aio_threads.max_threads == 0 {
            return Err(SettingsError::NoIoThreads);
        }
        if self.file_pool_size == 0 {
            return Err(SettingsError::EmptyFilePool);
        }
        if self.thread_idle_timeout.is_zero() {
            return Err(SettingsError::ZeroIdleTimeout);
        }
        if !(self.trim_headroom > 0.0 && self.trim_headroom <= 1.0) {
            return Err(SettingsError::InvalidTrimHeadroom(self.trim_headroom));
        }
        Ok(())
    }

    /// Pieces kept by each ghost list.
    pub fn ghost_limit(&self) -> usize {
        self.ghost_size
            .unwrap_or(self.cache_size / 8)
            .max(MIN_GHOST_PIECES)
    }

    /// Blocks a pressure trim frees, at least one.
    pub fn trim_blocks(&self) -> usize {
        ((self.cache_size as f32 * self.trim_headroom).ceil() as usize).max(1)
    }

    pub(crate) fn routes_hashes_to_generic(&self) -> bool {
        self.hashing_threads.max_threads == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = DiskSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.file_pool_size, 40);
        assert_eq!(settings.ghost_limit(), DEFAULT_CACHE_BLOCKS / 8);
        assert!(!settings.routes_hashes_to_generic());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(
            DiskSettings::default().with_block_size(1000).validate(),
            Err(SettingsError::InvalidBlockSize(1000))
        );
        assert!(matches!(
            DiskSettings::default().with_cache_size(0).validate(),
            Err(SettingsError::InvalidCacheSize { got: 0, .. })
        ));
        assert!(matches!(
            DiskSettings::default()
                .with_aio_threads(PoolSettings::new(3, 2))
                .validate(),
            Err(SettingsError::InvalidThreadRange { pool: "aio", .. })
        ));
        assert_eq!(
            DiskSettings::default()
                .with_aio_threads(PoolSettings::new(0, 0))
                .validate(),
            Err(SettingsError::NoIoThreads)
        );
        assert!(DiskSettings::default()
            .with_trim_headroom(0.0)
            .validate()
            .is_err());
        assert_eq!(
            DiskSettings::default()
                .with_thread_idle_timeout(Duration::ZERO)
                .validate(),
            Err(SettingsError::ZeroIdleTimeout)
        );
    }

    #[test]
    fn test_derived_limits() {
        let settings = DiskSettings::default()
            .with_cache_size(16)
            .with_trim_headroom(0.25);
        assert_eq!(settings.ghost_limit(), MIN_GHOST_PIECES);
        assert_eq!(settings.trim_blocks(), 4);
        assert_eq!(settings.with_ghost_size(100).ghost_limit(), 100);

        let no_hashers = DiskSettings::default().with_hashing_threads(PoolSettings::new(0, 0));
        assert!(no_hashers.routes_hashes_to_generic());
    }
}
