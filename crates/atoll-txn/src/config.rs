//! Transaction configuration.

use std::time::Duration;

use atoll_core::DurabilityLevel;

/// Default attempt expiration.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15);

/// Default cleanup queue capacity.
pub const DEFAULT_CLEANUP_QUEUE_CAPACITY: usize = 10_000;

/// Configuration for a [`Transactions`](crate::Transactions) session.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// How long an attempt may run before becoming eligible for lost
    /// cleanup. Operations past expiry fail with `Expired`.
    pub expiration: Duration,
    /// Durability requested for every protocol mutation.
    pub durability: DurabilityLevel,
    /// Per-operation key-value timeout (`None` = collaborator default).
    pub kv_timeout: Option<Duration>,
    /// Cleanup subsystem configuration.
    pub cleanup: CleanupConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_EXPIRATION,
            durability: DurabilityLevel::default(),
            kv_timeout: None,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl TransactionConfig {
    /// Sets the attempt expiration.
    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Sets the durability level for protocol mutations.
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the per-operation key-value timeout.
    #[must_use]
    pub fn with_kv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.kv_timeout = timeout;
        self
    }

    /// Sets the cleanup configuration.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }
}

/// Configuration for the cleanup subsystem.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Whether the session drains its own cleanup queue on a background
    /// task. When disabled the queue only accumulates, which is useful for
    /// passive inspection and tests.
    pub cleanup_client_attempts: bool,
    /// Capacity ceiling of the cleanup work queue. Producers are rejected
    /// (not blocked) once it is reached.
    pub queue_capacity: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_client_attempts: true,
            queue_capacity: DEFAULT_CLEANUP_QUEUE_CAPACITY,
        }
    }
}

impl CleanupConfig {
    /// Enables or disables the background consumer.
    #[must_use]
    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    /// Sets the queue capacity ceiling.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}
