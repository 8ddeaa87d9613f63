//! S3 Build Cache - local caching proxy between a build tool and an S3-compatible store
//!
//! This library provides the request-handling engine: the in-memory LRU cache, the HTTP
//! front end, the asynchronous upload pipeline with disk staging, and the circuit breaker
//! guarding the remote store.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod logging;
pub mod memory_cache;
pub mod remote_store;
pub mod runtime_state;
pub mod s3_client;
pub mod shutdown;
pub mod upload_staging;

pub use error::{ProxyError, Result};
