//! Runtime-tunable knobs.
//!
//! A hosted engine serving arbitrary device pairs keeps these as runtime
//! configuration rather than compile-time constants, validated once at
//! `Engine::open`.

use crate::error::{Error, Result};

/// Upper bound on `checkpoint_interval_ms`, i.e. `WALB_MAX_CHECKPOINT_INTERVAL`.
pub const WALB_MAX_CHECKPOINT_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Maximum number of records a single log pack header can hold.
pub const MAX_RECORDS_PER_PACK: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget, in physical blocks, for a single log pack (header + payload).
    pub max_logpack_pb: u32,

    /// Upper bound on time between FLUSHes when the log device lacks FUA.
    pub log_flush_interval_ms: u64,

    /// Upper bound on physical blocks written between FLUSHes when the log
    /// device lacks FUA.
    pub log_flush_interval_pb: u32,

    /// Bound on how many data writes are reordered for sequentiality.
    pub n_io_bulk: usize,

    /// Back-pressure: stop accepting new upstream writes above this many
    /// in-flight megabytes.
    pub max_pending_mb: u64,

    /// Back-pressure: resume accepting once in-flight falls at or below this.
    pub min_pending_mb: u64,

    /// How long back-pressure may block before the engine goes read-only.
    pub queue_stop_timeout_ms: u64,

    /// Checkpoint period.
    pub checkpoint_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_logpack_pb: 512,
            log_flush_interval_ms: 100,
            log_flush_interval_pb: 2048,
            n_io_bulk: 64,
            max_pending_mb: 64,
            min_pending_mb: 32,
            queue_stop_timeout_ms: 30_000,
            checkpoint_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_logpack_pb == 0 {
            return Err(Error::InvalidArgument("max_logpack_pb must be > 0".into()));
        }
        if self.min_pending_mb > self.max_pending_mb {
            return Err(Error::InvalidArgument(
                "min_pending_mb must be <= max_pending_mb".into(),
            ));
        }
        if self.checkpoint_interval_ms > WALB_MAX_CHECKPOINT_INTERVAL_MS {
            return Err(Error::InvalidArgument(format!(
                "checkpoint_interval_ms {} exceeds WALB_MAX_CHECKPOINT_INTERVAL_MS {}",
                self.checkpoint_interval_ms, WALB_MAX_CHECKPOINT_INTERVAL_MS
            )));
        }
        Ok(())
    }
}
