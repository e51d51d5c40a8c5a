//! Error types for cache operations.

use std::fmt;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The allocator could not provide memory for the record or table.
    OutOfMemory,

    /// Admission was denied: the cache or the manager is at its memory limit
    /// and nothing could be reclaimed to make room.
    ResourceLimit,

    /// Lock contention exhausted the operation's retry budget.
    /// The caller may retry.
    Busy,

    /// Key not found (for remove operations).
    NotFound,

    /// The key is currently banished at its bucket and may not be inserted.
    Banished,

    /// The cache has begun shutting down; no further admissions.
    Shutdown,

    /// Operation not supported by this cache flavor.
    NotSupported,

    /// The key or value exceeds the representable size bound.
    TooLarge,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::ResourceLimit => write!(f, "memory limit reached"),
            Self::Busy => write!(f, "lock contention budget exhausted"),
            Self::NotFound => write!(f, "key not found"),
            Self::Banished => write!(f, "key is banished"),
            Self::Shutdown => write!(f, "cache is shut down"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::TooLarge => write!(f, "key or value too large"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
