//! Server Runtime State
//!
//! Mutable state shared by every request handler. Locks here are held only for short,
//! synchronous sections and never across an await point.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::memory_cache::MemoryCache;
use crate::shutdown::IdleTimer;
use crate::upload_staging::{PendingUploadBudget, UploadStaging};
use std::sync::{Arc, Mutex};

pub struct ServerRuntimeState {
    pub cache: Mutex<MemoryCache>,
    pub breaker: Mutex<CircuitBreaker>,
    pub budget: Arc<PendingUploadBudget>,
    pub staging: UploadStaging,
    pub idle_timer: IdleTimer,
}

impl ServerRuntimeState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache: Mutex::new(MemoryCache::new(
                config.cache.enabled,
                config.cache.max_entry_size_bytes,
                config.cache.max_total_size_bytes,
            )),
            breaker: Mutex::new(CircuitBreaker::new(
                config.circuit_breaker.errors_before_pausing,
                config.circuit_breaker.pause_duration,
            )),
            budget: Arc::new(PendingUploadBudget::new(config.pending_upload_ceiling_bytes())),
            staging: UploadStaging::new(config.async_upload.cache_dir.clone()),
            idle_timer: IdleTimer::new(config.idle_timeout()),
        }
    }

    /// Whether remote store access is currently suppressed
    pub fn store_paused(&self) -> bool {
        self.breaker.lock().unwrap().is_paused()
    }

    /// Feed a remote call outcome to the breaker; not-found counts as success
    pub fn record_store_outcome(&self, succeeded: bool) {
        let mut breaker = self.breaker.lock().unwrap();
        if succeeded {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }
}
