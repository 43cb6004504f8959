//! Configuration types for rs2-flow producers and parallel operators

use serde::{Deserialize, Serialize};

/// What a consumer loop does when its detached producer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerErrorPolicy {
    /// Yield the error to the consumer and end the sequence
    #[default]
    FailFast,
    /// Log the error, deliver what is already buffered, then end normally
    LogAndContinue,
}

/// Configuration shared by event and pool producers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub error_policy: ProducerErrorPolicy,
}

impl ProducerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the producer error policy
    pub fn error_policy(mut self, policy: ProducerErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Configuration for bounded parallel operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum number of transforms in flight at once
    pub concurrency: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
        }
    }
}

impl ParallelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the window size
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Window size actually used by the executor (never zero).
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            log::warn!("parallel concurrency of 0 requested, using 1");
            1
        } else {
            self.concurrency
        }
    }
}

/// Configuration for an [`IteratorPool`](crate::IteratorPool)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of buffered-but-undelivered items
    pub size: usize,
    pub error_policy: ProducerErrorPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            error_policy: ProducerErrorPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn error_policy(mut self, policy: ProducerErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Capacity actually used by the pool (never zero).
    pub fn effective_size(&self) -> usize {
        if self.size == 0 {
            log::warn!("pool size of 0 requested, using 1");
            1
        } else {
            self.size
        }
    }
}

impl From<&PoolConfig> for ProducerConfig {
    fn from(config: &PoolConfig) -> Self {
        ProducerConfig {
            error_policy: config.error_policy,
        }
    }
}
